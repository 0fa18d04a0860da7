use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::item::CacheItem;
use crate::store::PersistentStore;

/// Owner of the per-key entry map and the persistence layer.
///
/// Only the storage cache mutates the map. Cloning is cheap and shares the
/// same state, so background tasks (teardown timers, the storage listener)
/// can hold their own handle.
pub(crate) struct StorageCache<V>
where
    V: Clone + Send + Sync,
{
    shared: Arc<Shared<V>>,
}

struct Shared<V> {
    entries: Mutex<HashMap<String, Arc<CacheEntry<V>>>>,
    store: Option<Arc<dyn PersistentStore>>,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl<V> Clone for StorageCache<V>
where
    V: Clone + Send + Sync,
{
    fn clone(&self) -> Self {
        StorageCache {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> StorageCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(
        store: Option<Arc<dyn PersistentStore>>,
        namespace: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        StorageCache {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                store,
                namespace,
                clock,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    /// Return the live entry for the key, skipping stopped ones.
    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let entries = self.shared.entries.lock().unwrap();
        entries.get(key).filter(|e| !e.is_stopped()).cloned()
    }

    /// Return the existing entry for the key or create a new one.
    ///
    /// A new entry is seeded from a non-expired persisted item when one
    /// exists, else from `fallback` (the caller's initial data, already
    /// wrapped with `expires_at = 0` so it counts as immediately stale).
    pub(crate) async fn get_or_init(
        &self,
        key: &str,
        fallback: Option<CacheItem<V>>,
    ) -> Arc<CacheEntry<V>> {
        if let Some(entry) = self.lookup(key) {
            return entry;
        }

        let persisted = self.load_persisted(key).await;

        let mut entries = self.shared.entries.lock().unwrap();
        // The store read suspended; someone may have initialized meanwhile
        if let Some(entry) = entries.get(key)
            && !entry.is_stopped()
        {
            return Arc::clone(entry);
        }

        let initial = persisted.or(fallback);
        tracing::debug!(key, seeded = initial.is_some(), "initializing cache entry");
        let entry = Arc::new(CacheEntry::new(key.to_string(), initial));
        entries.insert(key.to_string(), Arc::clone(&entry));
        entry
    }

    /// Tear down an idle entry: complete its channels, remove it from the
    /// map, and drop its persisted copy when expired.
    ///
    /// `expected` guards against tearing down a successor entry that reused
    /// the key after this one was replaced.
    pub(crate) async fn stop_and_delete(&self, key: &str, expected: &Arc<CacheEntry<V>>) {
        let removed = {
            let mut entries = self.shared.entries.lock().unwrap();
            let Some(current) = entries.get(key) else {
                return;
            };
            if !Arc::ptr_eq(current, expected) {
                return;
            }
            {
                let state = current.state.lock().unwrap();
                if state.subscription_count > 0 {
                    return;
                }
                current.mark_stopped();
            }
            entries.remove(key)
        };
        let Some(entry) = removed else { return };

        tracing::debug!(key, "tearing down idle cache entry");
        let now = self.shared.clock.now_ms();
        let expired = entry
            .current_item()
            .map(|item| item.is_expired(now))
            .unwrap_or(true);
        if expired {
            self.remove_persisted(key).await;
        }
        // Channels complete when the last reference to the entry drops
    }

    /// Drop a dead entry from the map without touching the store. Used after
    /// a terminal fetch failure, where nothing was ever persisted.
    pub(crate) fn discard(&self, key: &str, expected: &Arc<CacheEntry<V>>) {
        let mut entries = self.shared.entries.lock().unwrap();
        if let Some(current) = entries.get(key)
            && Arc::ptr_eq(current, expected)
        {
            entries.remove(key);
        }
    }

    /// Reconcile in-memory entries with the persisted map.
    ///
    /// Expired persisted items are pruned. An item only replaces in-memory
    /// state when its expiry is strictly later than the current one, keeping
    /// cross-context updates monotonic.
    pub(crate) async fn sync_with_storage(&self) {
        if self.shared.store.is_none() {
            return;
        }

        let mut map = self.read_persisted().await;
        let now = self.shared.clock.now_ms();
        map.retain(|_, item| !item.is_expired(now));

        for (key, item) in &map {
            let Some(entry) = self.lookup(key) else {
                continue;
            };
            let newer = match entry.current_expires_at() {
                Some(current) => item.expires_at > current,
                None => true,
            };
            if newer {
                tracing::debug!(key, "applying persisted update from another context");
                entry.push_item(item.clone());
            }
        }

        self.write_persisted(&map).await;
    }

    /// Write one item into the persisted map, pruning expired neighbors.
    pub(crate) async fn persist(&self, key: &str, item: &CacheItem<V>) {
        if self.shared.store.is_none() {
            return;
        }
        let mut map = self.read_persisted().await;
        let now = self.shared.clock.now_ms();
        map.retain(|_, existing| !existing.is_expired(now));
        map.insert(key.to_string(), item.clone());
        self.write_persisted(&map).await;
    }

    async fn remove_persisted(&self, key: &str) {
        if self.shared.store.is_none() {
            return;
        }
        let mut map = self.read_persisted().await;
        if map.remove(key).is_some() {
            self.write_persisted(&map).await;
        }
    }

    async fn load_persisted(&self, key: &str) -> Option<CacheItem<V>> {
        let mut map = self.read_persisted().await;
        let item = map.remove(key)?;
        if item.is_expired(self.shared.clock.now_ms()) {
            return None;
        }
        Some(item)
    }

    /// Read the persisted map. Store failures are swallowed: persistence is
    /// best-effort and never changes in-memory behavior.
    ///
    /// An ordered map keeps the serialized form deterministic, so rewriting
    /// unchanged state produces a byte-identical value and storage listeners
    /// can rely on their `new != old` guard.
    async fn read_persisted(&self) -> BTreeMap<String, CacheItem<V>> {
        let Some(store) = &self.shared.store else {
            return BTreeMap::new();
        };
        match store.get(&self.shared.namespace).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "discarding undecodable persisted cache");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(store = store.name(), error = %e, "failed to read persisted cache");
                BTreeMap::new()
            }
        }
    }

    async fn write_persisted(&self, map: &BTreeMap<String, CacheItem<V>>) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let raw = match serde_json::to_string(map) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(store = store.name(), error = %e, "failed to encode persisted cache");
                return;
            }
        };
        if let Err(e) = store.set(&self.shared.namespace, &raw).await {
            tracing::warn!(store = store.name(), error = %e, "failed to write persisted cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stores::memory::MemoryStore;

    fn cache_with(
        store: Option<Arc<dyn PersistentStore>>,
        clock: Arc<ManualClock>,
    ) -> StorageCache<String> {
        StorageCache::new(store, "sswr".to_string(), clock)
    }

    #[tokio::test]
    async fn test_get_or_init_returns_same_entry() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache_with(None, clock);

        let a = cache.get_or_init("k", None).await;
        let b = cache.get_or_init("k", None).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_entry_is_replaced() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache_with(None, clock);

        let a = cache.get_or_init("k", None).await;
        a.fail(crate::error::SwrError::fetch("k", "boom"));
        cache.discard("k", &a);

        let b = cache.get_or_init("k", None).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!b.is_stopped());
    }

    #[tokio::test]
    async fn test_init_prefers_unexpired_persisted_item() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let persisted: HashMap<String, CacheItem<String>> = HashMap::from([(
            "k".to_string(),
            CacheItem::new("from-store".to_string(), 5_000),
        )]);
        store
            .set("sswr", &serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let cache = cache_with(Some(store), clock);
        let entry = cache
            .get_or_init("k", Some(CacheItem::new("fallback".to_string(), 0)))
            .await;

        assert_eq!(entry.current_item().unwrap().data, "from-store");
    }

    #[tokio::test]
    async fn test_init_falls_back_when_persisted_expired() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(MemoryStore::new());
        let persisted: HashMap<String, CacheItem<String>> =
            HashMap::from([("k".to_string(), CacheItem::new("old".to_string(), 5_000))]);
        store
            .set("sswr", &serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let cache = cache_with(Some(store), clock);
        let entry = cache
            .get_or_init("k", Some(CacheItem::new("fallback".to_string(), 0)))
            .await;

        let item = entry.current_item().unwrap();
        assert_eq!(item.data, "fallback");
        // Caller-supplied initial data counts as immediately stale
        assert_eq!(item.expires_at, 0);
    }

    #[tokio::test]
    async fn test_sync_applies_only_strictly_newer_items() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Some(store.clone()), clock);

        let entry = cache
            .get_or_init("k", Some(CacheItem::new("current".to_string(), 5_000)))
            .await;

        // Equal expiry: rejected
        let map: HashMap<String, CacheItem<String>> =
            HashMap::from([("k".to_string(), CacheItem::new("equal".to_string(), 5_000))]);
        store
            .set("sswr", &serde_json::to_string(&map).unwrap())
            .await
            .unwrap();
        cache.sync_with_storage().await;
        assert_eq!(entry.current_item().unwrap().data, "current");

        // Strictly newer expiry: applied
        let map: HashMap<String, CacheItem<String>> =
            HashMap::from([("k".to_string(), CacheItem::new("newer".to_string(), 5_001))]);
        store
            .set("sswr", &serde_json::to_string(&map).unwrap())
            .await
            .unwrap();
        cache.sync_with_storage().await;
        assert_eq!(entry.current_item().unwrap().data, "newer");
    }

    #[tokio::test]
    async fn test_sync_prunes_expired_items_from_store() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Some(store.clone()), clock.clone());

        let map: HashMap<String, CacheItem<String>> = HashMap::from([
            ("live".to_string(), CacheItem::new("a".to_string(), 5_000)),
            ("dead".to_string(), CacheItem::new("b".to_string(), 500)),
        ]);
        store
            .set("sswr", &serde_json::to_string(&map).unwrap())
            .await
            .unwrap();

        cache.sync_with_storage().await;

        let raw = store.get("sswr").await.unwrap().unwrap();
        let written: HashMap<String, CacheItem<String>> = serde_json::from_str(&raw).unwrap();
        assert!(written.contains_key("live"));
        assert!(!written.contains_key("dead"));
    }

    #[tokio::test]
    async fn test_undecodable_persisted_state_is_ignored() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        store.set("sswr", "not json").await.unwrap();

        let cache = cache_with(Some(store), clock);
        let entry = cache.get_or_init("k", None).await;
        assert!(entry.current_item().is_none());
    }
}
