use serde::{Deserialize, Serialize};

/// A cached value together with its expiration instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem<V> {
    /// The cached value.
    pub data: V,

    /// Unix timestamp in milliseconds.
    /// At and after this instant the item is considered stale and a
    /// subscriber will trigger revalidation.
    pub expires_at: i64,
}

impl<V> CacheItem<V> {
    /// Create a new cache item with an absolute expiry.
    pub fn new(data: V, expires_at: i64) -> Self {
        CacheItem { data, expires_at }
    }

    /// Check if the item has expired.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at < now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let item = CacheItem::new("value", 1_000);
        assert!(!item.is_expired(999));
        // An item expiring exactly now is still usable
        assert!(!item.is_expired(1_000));
        assert!(item.is_expired(1_001));
    }
}
