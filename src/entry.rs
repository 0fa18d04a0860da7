use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SwrError;
use crate::item::CacheItem;

/// Latest state of an entry's value channel.
#[derive(Debug, Clone)]
pub(crate) enum Source<V> {
    /// No value has been produced yet.
    Empty,
    /// The most recent cache item.
    Item(CacheItem<V>),
    /// Retries were exhausted before any data arrived. Terminal: no further
    /// values follow and the entry is discarded.
    Failed(SwrError),
}

/// Subscription bookkeeping, guarded by one lock so that refcount changes and
/// task handles move together.
pub(crate) struct EntryState {
    pub(crate) subscription_count: usize,
    /// Pending teardown timer; present only while the refcount is zero.
    pub(crate) teardown: Option<JoinHandle<()>>,
    /// Focus/online listener; present only while the refcount is positive.
    pub(crate) revalidation: Option<JoinHandle<()>>,
}

/// Per-key reactive state.
///
/// The entry holds no behavior of its own; the storage cache and the facade
/// drive all transitions. Channel completion is modeled by sender drop: when
/// the last reference to the entry goes away, every receiver observes the
/// channel closing.
pub(crate) struct CacheEntry<V> {
    key: String,
    pub(crate) source: watch::Sender<Source<V>>,
    pub(crate) errors: watch::Sender<Option<SwrError>>,
    pub(crate) is_validating: watch::Sender<bool>,
    pub(crate) state: Mutex<EntryState>,
    stopped: AtomicBool,
}

impl<V> CacheEntry<V>
where
    V: Clone + Send + Sync,
{
    pub(crate) fn new(key: String, initial: Option<CacheItem<V>>) -> Self {
        let source = match initial {
            Some(item) => Source::Item(item),
            None => Source::Empty,
        };
        CacheEntry {
            key,
            source: watch::Sender::new(source),
            errors: watch::Sender::new(None),
            is_validating: watch::Sender::new(false),
            state: Mutex::new(EntryState {
                subscription_count: 0,
                teardown: None,
                revalidation: None,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn current_item(&self) -> Option<CacheItem<V>> {
        match &*self.source.borrow() {
            Source::Item(item) => Some(item.clone()),
            _ => None,
        }
    }

    pub(crate) fn current_expires_at(&self) -> Option<i64> {
        match &*self.source.borrow() {
            Source::Item(item) => Some(item.expires_at),
            _ => None,
        }
    }

    pub(crate) fn has_item(&self) -> bool {
        matches!(&*self.source.borrow(), Source::Item(_))
    }

    /// Push a new item. Ignored once the entry has stopped so that a fetch
    /// completing against a dead entry is discarded.
    pub(crate) fn push_item(&self, item: CacheItem<V>) {
        if self.is_stopped() {
            return;
        }
        self.source.send_replace(Source::Item(item));
    }

    /// Terminal failure: no data ever arrived and retries are exhausted.
    pub(crate) fn fail(&self, error: SwrError) {
        self.stopped.store(true, Ordering::SeqCst);
        self.source.send_replace(Source::Failed(error));
    }

    pub(crate) fn set_error(&self, error: SwrError) {
        self.errors.send_replace(Some(error));
    }

    pub(crate) fn clear_error(&self) {
        self.errors.send_if_modified(|current| {
            if current.is_some() {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Raise the validating flag. Returns `false` when a validation is
    /// already in flight; the check and the set are one atomic step, which is
    /// what keeps fetches single-flight per key.
    pub(crate) fn begin_validation(&self) -> bool {
        self.is_validating.send_if_modified(|validating| {
            if *validating {
                false
            } else {
                *validating = true;
                true
            }
        })
    }

    pub(crate) fn end_validation(&self) {
        self.is_validating.send_if_modified(|validating| {
            if *validating {
                *validating = false;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn validating(&self) -> bool {
        *self.is_validating.borrow()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Callers must hold the state lock so the flag cannot race a concurrent
    /// subscription.
    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_gate_is_single_flight() {
        let entry: CacheEntry<String> = CacheEntry::new("k".to_string(), None);

        assert!(entry.begin_validation());
        assert!(entry.validating());
        // Second validation is refused while the first is in flight
        assert!(!entry.begin_validation());

        entry.end_validation();
        assert!(!entry.validating());
        assert!(entry.begin_validation());
    }

    #[test]
    fn test_push_after_stop_is_discarded() {
        let entry: CacheEntry<String> = CacheEntry::new("k".to_string(), None);
        entry.fail(crate::error::SwrError::fetch("k", "boom"));

        entry.push_item(CacheItem::new("late".to_string(), 10_000));
        assert!(entry.current_item().is_none());
        assert!(matches!(&*entry.source.borrow(), Source::Failed(_)));
    }

    #[test]
    fn test_clear_error_only_fires_when_set() {
        let entry: CacheEntry<String> = CacheEntry::new("k".to_string(), None);
        let mut rx = entry.errors.subscribe();

        entry.clear_error();
        assert!(!rx.has_changed().unwrap());

        entry.set_error(crate::error::SwrError::fetch("k", "boom"));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        entry.clear_error();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn test_initial_item() {
        let entry = CacheEntry::new(
            "k".to_string(),
            Some(CacheItem::new("seed".to_string(), 5_000)),
        );
        assert_eq!(entry.current_item().unwrap().data, "seed");
        assert_eq!(entry.current_expires_at(), Some(5_000));
        assert!(entry.has_item());
    }
}
