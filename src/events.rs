//! Environment signal channels: focus, online, and storage change events.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// A change to the shared persistent store made by some context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The store key that changed.
    pub key: String,
    /// The serialized value after the change; `None` for a removal.
    pub new_value: Option<String>,
    /// The serialized value before the change; `None` if the key was absent.
    pub old_value: Option<String>,
}

/// Multi-subscriber channels for the ambient signals that drive revalidation.
///
/// The bus itself never produces events; the embedding environment (window
/// focus handlers, connectivity callbacks, a store) emits into it. In an
/// environment without a given signal the channel is simply silent, which is
/// valid: subscribers just never wake.
pub struct EventBus {
    focus: broadcast::Sender<()>,
    online: broadcast::Sender<()>,
    storage: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (focus, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (online, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (storage, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus {
            focus,
            online,
            storage,
        }
    }

    /// Signal that the application regained focus.
    pub fn emit_focus(&self) {
        let _ = self.focus.send(());
    }

    /// Signal that connectivity was restored.
    pub fn emit_online(&self) {
        let _ = self.online.send(());
    }

    /// Publish a storage change.
    pub fn emit_storage(&self, event: StorageEvent) {
        let _ = self.storage.send(event);
    }

    pub fn subscribe_focus(&self) -> broadcast::Receiver<()> {
        self.focus.subscribe()
    }

    pub fn subscribe_online(&self) -> broadcast::Receiver<()> {
        self.online.subscribe()
    }

    pub fn subscribe_storage(&self) -> broadcast::Receiver<StorageEvent> {
        self.storage.subscribe()
    }

    /// Sender half of the storage channel, for stores that publish their own
    /// writes.
    pub fn storage_sender(&self) -> broadcast::Sender<StorageEvent> {
        self.storage.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_focus_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_focus();
        let mut b = bus.subscribe_focus();

        bus.emit_focus();

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_storage_event_payload() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_storage();

        bus.emit_storage(StorageEvent {
            key: "sswr".to_string(),
            new_value: Some("b".to_string()),
            old_value: Some("a".to_string()),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "sswr");
        assert_eq!(event.new_value.as_deref(), Some("b"));
        assert_eq!(event.old_value.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // No receiver exists; emitting must not fail
        bus.emit_online();
    }
}
