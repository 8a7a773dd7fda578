//! Store key derivation.

use crate::error::{FloodgateError, Result};

/// A key that uniquely identifies a bucket in the store.
///
/// The key is the limiter prefix followed directly by the caller key. No
/// delimiter is inserted, so prefixes must be chosen to avoid collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    full: String,
    prefix_len: usize,
}

impl BucketKey {
    /// Create a bucket key from a prefix and a caller-supplied key.
    ///
    /// Returns `InvalidKey` if the caller key is empty.
    pub fn new(prefix: &str, caller_key: &str) -> Result<Self> {
        if caller_key.is_empty() {
            return Err(FloodgateError::InvalidKey(
                "caller key must not be empty".to_string(),
            ));
        }

        let mut full = String::with_capacity(prefix.len() + caller_key.len());
        full.push_str(prefix);
        full.push_str(caller_key);

        Ok(Self {
            full,
            prefix_len: prefix.len(),
        })
    }

    /// The full store key.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The namespace portion of the key.
    pub fn prefix(&self) -> &str {
        &self.full[..self.prefix_len]
    }

    /// The caller-supplied portion of the key.
    pub fn caller_key(&self) -> &str {
        &self.full[self.prefix_len..]
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_concatenates_without_delimiter() {
        let key = BucketKey::new("myapp:rl:", "user:123").unwrap();

        assert_eq!(key.as_str(), "myapp:rl:user:123");
        assert_eq!(key.prefix(), "myapp:rl:");
        assert_eq!(key.caller_key(), "user:123");
    }

    #[test]
    fn test_bucket_key_empty_prefix() {
        let key = BucketKey::new("", "user:123").unwrap();
        assert_eq!(key.as_str(), "user:123");
        assert_eq!(key.prefix(), "");
    }

    #[test]
    fn test_bucket_key_rejects_empty_caller_key() {
        let err = BucketKey::new("prefix:", "").unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidKey(_)));
    }

    #[test]
    fn test_different_prefixes_produce_different_keys() {
        let a = BucketKey::new("a:", "user").unwrap();
        let b = BucketKey::new("b:", "user").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.caller_key(), b.caller_key());
    }

    #[test]
    fn test_display() {
        let key = BucketKey::new("rl:", "k").unwrap();
        assert_eq!(key.to_string(), "rl:k");
    }
}
