/// Error type for cache operations and fetch failures.
///
/// The error is `Clone` because the last fetch failure is retained on a
/// latest-value channel and handed to every subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SwrError {
    /// The fetcher rejected for the given key.
    #[error("fetch failed for key '{key}': {message}")]
    Fetch { key: String, message: String },
    /// A persistent store operation failed.
    #[error("[{store}] store error: {message}")]
    Store { store: String, message: String },
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SwrError {
    /// Create a new fetch error.
    pub fn fetch(key: impl Into<String>, message: impl Into<String>) -> Self {
        SwrError::Fetch {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new store error.
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        SwrError::Store {
            store: store.into(),
            message: message.into(),
        }
    }
}
