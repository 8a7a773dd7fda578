//! Rate limiting logic and bucket storage.

mod backend;
mod bucket;
mod clock;
mod key;
mod limiter;
mod memory;
mod redis_backend;

pub use backend::BucketBackend;
pub use bucket::{BucketParams, BucketState, Decision, MAX_TTL_MILLIS};
pub use clock::{Clock, MockClock, SystemClock};
pub use key::BucketKey;
pub use limiter::{LimiterConfig, RateLimiter};
pub use memory::{MemoryBackend, SWEEP_EVERY_WRITES};
pub use redis_backend::{RedisBackend, REFILL_AND_CONSUME};
