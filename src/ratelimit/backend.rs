//! Bucket backend trait for abstracting the shared store.

use async_trait::async_trait;

use super::bucket::{BucketParams, Decision};
use crate::error::Result;

/// Trait for stores that hold bucket state.
///
/// `refill_and_consume` is one opaque atomic transaction: no other call on
/// the same key may observe or produce an intermediate state. Implementations
/// must not retry; a failure is returned to the caller as-is.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Refill the bucket at `key` and try to take `params.cost` tokens.
    async fn refill_and_consume(&self, key: &str, params: &BucketParams) -> Result<Decision>;

    /// Delete the bucket at `key`, so the next call sees a fresh bucket.
    async fn reset(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<B: BucketBackend + ?Sized> BucketBackend for std::sync::Arc<B> {
    async fn refill_and_consume(&self, key: &str, params: &BucketParams) -> Result<Decision> {
        (**self).refill_and_consume(key, params).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        (**self).reset(key).await
    }
}
