use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::SwrError;
use crate::events::StorageEvent;

/// A persistent key/value store shared between contexts.
///
/// The cache keeps its whole persisted state under a single namespace key, so
/// a store only needs flat string storage. Absence of a store is valid: the
/// cache treats a missing store as a silent no-op backend.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// A name for tracing.
    ///
    /// # Example
    /// - "memory"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// Enumerate all stored pairs.
    async fn get_all(&self) -> Result<Vec<(String, String)>, SwrError>;

    /// Return the stored value, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>, SwrError>;

    /// Store the value for the given key.
    async fn set(&self, key: &str, value: &str) -> Result<(), SwrError>;

    /// Remove the key from the store.
    async fn remove(&self, key: &str) -> Result<(), SwrError>;

    /// Register a channel that receives a [`StorageEvent`] for every write
    /// this store performs.
    ///
    /// Stores without change notification keep the default no-op; the
    /// channel then stays silent, which subscribers must tolerate.
    fn subscribe(&self, channel: broadcast::Sender<StorageEvent>) {
        let _ = channel;
    }
}
