//! Deterministic encoding of fetch-argument tuples into cache keys.

use serde_json::Value;

use crate::error::SwrError;

/// The resolved key input for a subscription or mutation.
///
/// `NotReady` is the conditional-fetch mechanism: a key that depends on data
/// which is not available yet resolves to `NotReady`, and the cache hands back
/// inert streams instead of creating an entry.
#[derive(Debug, Clone)]
pub enum KeySpec {
    /// A tuple of fetch arguments, passed to the fetcher after decoding.
    Args(Vec<Value>),
    /// The key cannot be computed yet; no entry is created.
    NotReady,
}

impl KeySpec {
    /// Resolve a key from a factory.
    ///
    /// A factory returning `None` signals that the key is not ready (for
    /// example when it depends on the result of another subscription).
    ///
    /// # Example
    /// ```ignore
    /// let user = user_sub.current();
    /// let key = KeySpec::resolve(|| {
    ///     let user = user?;
    ///     Some(vec!["/posts".into(), user.id.into()])
    /// });
    /// ```
    pub fn resolve<F>(factory: F) -> Self
    where
        F: FnOnce() -> Option<Vec<Value>>,
    {
        match factory() {
            Some(args) => KeySpec::Args(args),
            None => KeySpec::NotReady,
        }
    }
}

impl From<Vec<Value>> for KeySpec {
    fn from(args: Vec<Value>) -> Self {
        KeySpec::Args(args)
    }
}

impl From<Value> for KeySpec {
    fn from(arg: Value) -> Self {
        KeySpec::Args(vec![arg])
    }
}

impl From<&str> for KeySpec {
    fn from(arg: &str) -> Self {
        KeySpec::Args(vec![Value::String(arg.to_string())])
    }
}

impl From<String> for KeySpec {
    fn from(arg: String) -> Self {
        KeySpec::Args(vec![Value::String(arg)])
    }
}

/// Encode a tuple of fetch arguments into a deterministic string key.
///
/// Arguments are always encoded as a JSON array, so a single argument and a
/// one-element tuple produce distinct keys from the bare value.
pub(crate) fn encode(args: &[Value]) -> Result<String, SwrError> {
    serde_json::to_string(args).map_err(|e| SwrError::Serialization(e.to_string()))
}

/// Recover the argument tuple from an encoded key.
pub(crate) fn decode(key: &str) -> Result<Vec<Value>, SwrError> {
    serde_json::from_str(key).map_err(|e| SwrError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_deterministic() {
        let args = vec![json!("/users"), json!({"page": 2, "limit": 10})];
        assert_eq!(encode(&args).unwrap(), encode(&args.clone()).unwrap());
    }

    #[test]
    fn test_encode_distinguishes_tuple_from_scalar() {
        let tuple = encode(&[json!("/users")]).unwrap();
        let bare = serde_json::to_string(&json!("/users")).unwrap();
        assert_ne!(tuple, bare);
    }

    #[test]
    fn test_round_trip() {
        let args = vec![json!("/users"), json!(42), json!(["a", "b"])];
        let key = encode(&args).unwrap();
        assert_eq!(decode(&key).unwrap(), args);
    }

    #[test]
    fn test_resolve_not_ready() {
        let key = KeySpec::resolve(|| None);
        assert!(matches!(key, KeySpec::NotReady));

        let key = KeySpec::resolve(|| Some(vec![json!("/x")]));
        assert!(matches!(key, KeySpec::Args(args) if args == vec![json!("/x")]));
    }
}
