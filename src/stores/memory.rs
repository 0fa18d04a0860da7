use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{RwLock, broadcast};

use crate::error::SwrError;
use crate::events::StorageEvent;
use crate::store::PersistentStore;

/// Thread-safe in-memory store using HashMap with RwLock.
///
/// MemoryStore publishes a [`StorageEvent`] to every subscribed channel on
/// each write, so two cache instances sharing one store observe each other's
/// changes the same way separate contexts sharing a real storage backend
/// would.
pub struct MemoryStore {
    state: RwLock<HashMap<String, String>>,
    channels: Mutex<Vec<broadcast::Sender<StorageEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: RwLock::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, key: &str, new_value: Option<&str>, old_value: Option<&str>) {
        let event = StorageEvent {
            key: key.to_string(),
            new_value: new_value.map(|v| v.to_string()),
            old_value: old_value.map(|v| v.to_string()),
        };
        let channels = self.channels.lock().unwrap();
        for channel in channels.iter() {
            // Channels without subscribers are fine to drop events on
            let _ = channel.send(event.clone());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_all(&self) -> Result<Vec<(String, String)>, SwrError> {
        let state = self.state.read().await;
        Ok(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SwrError> {
        let state = self.state.read().await;
        Ok(state.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SwrError> {
        let old = {
            let mut state = self.state.write().await;
            state.insert(key.to_string(), value.to_string())
        };
        self.notify(key, Some(value), old.as_deref());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SwrError> {
        let old = {
            let mut state = self.state.write().await;
            state.remove(key)
        };
        if old.is_some() {
            self.notify(key, None, old.as_deref());
        }
        Ok(())
    }

    fn subscribe(&self, channel: broadcast::Sender<StorageEvent>) {
        self.channels.lock().unwrap().push(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_remove() {
        let store = MemoryStore::new();

        // Initially empty
        assert!(store.get("sswr").await.unwrap().is_none());

        store.set("sswr", "value1").await.unwrap();
        assert_eq!(store.get("sswr").await.unwrap().as_deref(), Some("value1"));

        store.set("other", "value2").await.unwrap();
        let mut all = store.get_all().await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("other".to_string(), "value2".to_string()),
                ("sswr".to_string(), "value1".to_string()),
            ]
        );

        store.remove("sswr").await.unwrap();
        assert!(store.get("sswr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_notify_subscribed_channels() {
        let store = MemoryStore::new();
        let (tx, mut rx) = broadcast::channel(8);
        store.subscribe(tx);

        store.set("sswr", "v1").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "sswr");
        assert_eq!(event.new_value.as_deref(), Some("v1"));
        assert_eq!(event.old_value, None);

        store.set("sswr", "v2").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_value.as_deref(), Some("v2"));
        assert_eq!(event.old_value.as_deref(), Some("v1"));

        store.remove("sswr").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_value, None);
        assert_eq!(event.old_value.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_removing_absent_key_does_not_notify() {
        let store = MemoryStore::new();
        let (tx, mut rx) = broadcast::channel(8);
        store.subscribe(tx);

        store.remove("missing").await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
