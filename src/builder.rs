//! Builder API for assembling a cache instance.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::cache::StorageCache;
use crate::clock::{Clock, SystemClock};
use crate::events::EventBus;
use crate::store::PersistentStore;
use crate::swr::{Fetcher, Swr, SwrInner};

const DEFAULT_DEDUPING_INTERVAL_MS: i64 = 6_000;
const DEFAULT_ERROR_RETRY_INTERVAL_MS: i64 = 5_000;
const DEFAULT_ERROR_RETRY_COUNT: u32 = 3;
const DEFAULT_NAMESPACE: &str = "sswr";

/// Builder for a [`Swr`] cache.
///
/// Only the fetcher is required; everything else has a default: no
/// persistence, a private event bus, the system clock, and the standard
/// timing parameters.
///
/// # Example
/// ```ignore
/// let store = Arc::new(MemoryStore::new());
/// let swr: Swr<Profile> = Swr::builder(fetch_profile)
///     .store(store)
///     .deduping_interval_ms(10_000)
///     .build();
/// ```
pub struct SwrBuilder<V>
where
    V: Clone + Send + Sync,
{
    fetcher: Fetcher<V>,
    store: Option<Arc<dyn PersistentStore>>,
    events: Option<Arc<EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    deduping_interval_ms: i64,
    error_retry_interval_ms: i64,
    error_retry_count: u32,
    namespace: String,
}

impl<V> SwrBuilder<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(fetcher: Fetcher<V>) -> Self {
        SwrBuilder {
            fetcher,
            store: None,
            events: None,
            clock: None,
            deduping_interval_ms: DEFAULT_DEDUPING_INTERVAL_MS,
            error_retry_interval_ms: DEFAULT_ERROR_RETRY_INTERVAL_MS,
            error_retry_count: DEFAULT_ERROR_RETRY_COUNT,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Persist cache items to the given store and reconcile with it on
    /// storage events.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an event bus with the embedding environment. Without one the
    /// cache creates its own, reachable through [`Swr::events`].
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the time source. Tests inject a manual clock here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Lifetime granted to a freshly fetched item; also the teardown grace
    /// base. Default 6000 ms.
    pub fn deduping_interval_ms(mut self, ms: i64) -> Self {
        self.deduping_interval_ms = ms;
        self
    }

    /// Delay between retries on fetch failure. Default 5000 ms.
    pub fn error_retry_interval_ms(mut self, ms: i64) -> Self {
        self.error_retry_interval_ms = ms;
        self
    }

    /// Total fetch attempts before giving up. Default 3.
    pub fn error_retry_count(mut self, count: u32) -> Self {
        self.error_retry_count = count;
        self
    }

    /// Key under which the persisted map lives in the store. Default "sswr".
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Assemble the cache.
    ///
    /// Must be called within a Tokio runtime: the storage reconciliation
    /// listener is spawned here.
    pub fn build(self) -> Swr<V> {
        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::new()));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        if let Some(store) = &self.store {
            // The store announces its writes on the shared storage channel
            store.subscribe(events.storage_sender());
        }

        let cache = StorageCache::new(self.store, self.namespace.clone(), Arc::clone(&clock));

        let inner = Arc::new(SwrInner {
            fetcher: self.fetcher,
            deduping_interval_ms: self.deduping_interval_ms,
            error_retry_interval_ms: self.error_retry_interval_ms,
            error_retry_count: self.error_retry_count,
            cache: cache.clone(),
            events: Arc::clone(&events),
            clock,
            storage_listener: Mutex::new(None),
        });

        let namespace = self.namespace;
        let mut storage_rx = events.subscribe_storage();
        let listener = tokio::spawn(async move {
            loop {
                match storage_rx.recv().await {
                    Ok(event) => {
                        if event.key == namespace && event.new_value != event.old_value {
                            cache.sync_with_storage().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Events were dropped; reconcile unconditionally
                        cache.sync_with_storage().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *inner.storage_listener.lock().unwrap() = Some(listener);

        Swr::from_inner(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swr::Mutation;

    #[tokio::test]
    async fn test_defaults() {
        let swr: Swr<String> = Swr::new(|_args| async { Ok("value".to_string()) });
        assert!(swr.is_empty());
    }

    #[tokio::test]
    async fn test_custom_namespace_isolates_persisted_state() {
        let store = Arc::new(crate::stores::memory::MemoryStore::new());

        let a: Swr<String> = Swr::builder(|_args| async { Ok("a".to_string()) })
            .store(store.clone())
            .namespace("ns-a")
            .build();
        let b: Swr<String> = Swr::builder(|_args| async { Ok("b".to_string()) })
            .store(store.clone())
            .namespace("ns-b")
            .build();

        a.mutate("/k", Mutation::value("from-a".to_string()), Some(false), None)
            .await
            .unwrap();
        b.mutate("/k", Mutation::value("from-b".to_string()), Some(false), None)
            .await
            .unwrap();

        let raw_a = store.get("ns-a").await.unwrap().unwrap();
        let raw_b = store.get("ns-b").await.unwrap().unwrap();
        assert!(raw_a.contains("from-a"));
        assert!(raw_b.contains("from-b"));
    }
}
