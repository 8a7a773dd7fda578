//! Core rate limiter implementation.

use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::BucketBackend;
use super::bucket::{BucketParams, Decision, MAX_TTL_MILLIS};
use super::key::BucketKey;
use crate::error::{FloodgateError, Result};

/// Default refill rate in tokens per second.
const DEFAULT_RATE_PER_SECOND: f64 = 10.0;
/// Default bucket size.
const DEFAULT_CAPACITY: f64 = 10.0;
/// Default inactivity expiry.
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Default key namespace.
const DEFAULT_PREFIX: &str = "ratelimit:";

/// Immutable limiter configuration.
///
/// ```
/// use floodgate::ratelimit::LimiterConfig;
/// use std::time::Duration;
///
/// let config = LimiterConfig::default()
///     .with_rate_per_second(5.0)
///     .with_capacity(10.0)
///     .with_ttl(Duration::from_secs(3600))
///     .with_prefix("myapp:rl:");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Tokens added per elapsed second
    pub rate_per_second: f64,
    /// Maximum bucket size, i.e. maximum burst
    pub capacity: f64,
    /// Expiry of a key's stored state after its last use
    pub ttl: Duration,
    /// Namespace prepended to every caller key
    pub prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl LimiterConfig {
    /// Set the refill rate.
    pub fn with_rate_per_second(mut self, rate_per_second: f64) -> Self {
        self.rate_per_second = rate_per_second;
        self
    }

    /// Set the bucket capacity.
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the inactivity expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the key namespace.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Check every parameter.
    pub fn validate(&self) -> Result<()> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "rate_per_second must be a positive number, got {}",
                self.rate_per_second
            )));
        }

        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "capacity must be a positive number, got {}",
                self.capacity
            )));
        }

        // Store expiry has millisecond resolution.
        if self.ttl < Duration::from_millis(1) {
            return Err(FloodgateError::Config(format!(
                "ttl must be at least 1ms, got {:?}",
                self.ttl
            )));
        }

        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms > MAX_TTL_MILLIS {
            return Err(FloodgateError::Config(format!(
                "ttl must be at most {}ms, got {:?}",
                MAX_TTL_MILLIS, self.ttl
            )));
        }

        Ok(())
    }

    /// Per-call parameters for a backend.
    pub fn params(&self, cost: u32) -> BucketParams {
        BucketParams {
            rate_per_second: self.rate_per_second,
            capacity: self.capacity,
            ttl: self.ttl,
            cost,
        }
    }
}

/// Token-bucket rate limiter whose state lives entirely in a backend.
///
/// The limiter holds only its configuration, so it is cheap to clone and
/// safe to share across tasks without locking. Two limiters with the same
/// prefix over the same backend observe the same buckets.
#[derive(Debug, Clone)]
pub struct RateLimiter<B> {
    backend: B,
    config: LimiterConfig,
}

impl<B: BucketBackend> RateLimiter<B> {
    /// Create a limiter, validating `config` first.
    pub fn new(backend: B, config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            prefix = %config.prefix,
            rate_per_second = config.rate_per_second,
            capacity = config.capacity,
            ttl = ?config.ttl,
            "Rate limiter created"
        );

        Ok(Self { backend, config })
    }

    /// Decide whether one unit of work for `key` may proceed now.
    ///
    /// On error no decision was made; callers must check the result before
    /// acting, since a store failure is neither an allow nor a deny.
    pub async fn allow(&self, key: &str) -> Result<Decision> {
        self.allow_n(key, 1).await
    }

    /// Like [`allow`](Self::allow), consuming `cost` tokens on admission.
    ///
    /// A cost larger than the capacity is always denied.
    pub async fn allow_n(&self, key: &str, cost: u32) -> Result<Decision> {
        if cost == 0 {
            return Err(FloodgateError::InvalidCost(cost));
        }

        let bucket_key = BucketKey::new(&self.config.prefix, key)?;
        let params = self.config.params(cost);

        trace!(key = %bucket_key, cost = cost, "Checking rate limit");

        let decision = self
            .backend
            .refill_and_consume(bucket_key.as_str(), &params)
            .await
            .map_err(|e| {
                warn!(key = %bucket_key, error = %e, "Rate limit check failed");
                e
            })?;

        if !decision.allowed {
            debug!(
                key = %bucket_key,
                remaining = decision.remaining,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Like [`allow`](Self::allow), abandoning the store round trip after
    /// `timeout`.
    ///
    /// The atomic step either ran entirely on the store or not at all; a
    /// timeout only means this caller did not learn the outcome.
    pub async fn allow_within(&self, key: &str, timeout: Duration) -> Result<Decision> {
        self.allow_n_within(key, 1, timeout).await
    }

    /// Like [`allow_n`](Self::allow_n), bounded by `timeout` the same way as
    /// [`allow_within`](Self::allow_within).
    pub async fn allow_n_within(&self, key: &str, cost: u32, timeout: Duration) -> Result<Decision> {
        tokio::time::timeout(timeout, self.allow_n(key, cost))
            .await
            .map_err(|_| {
                warn!(key = %key, timeout = ?timeout, "Rate limit check timed out");
                FloodgateError::StoreUnavailable(format!(
                    "no reply within {:?}",
                    timeout
                ))
            })?
    }

    /// Forget the bucket for `key`; the next call sees a full bucket.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let bucket_key = BucketKey::new(&self.config.prefix, key)?;
        self.backend.reset(bucket_key.as_str()).await
    }

    /// The store key used for `key`.
    pub fn store_key(&self, key: &str) -> Result<String> {
        Ok(BucketKey::new(&self.config.prefix, key)?.as_str().to_string())
    }

    /// The limiter configuration.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The backend this limiter talks to.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::memory::MemoryBackend;
    use async_trait::async_trait;

    fn test_limiter(rate: f64, capacity: f64) -> RateLimiter<MemoryBackend<MockClock>> {
        let config = LimiterConfig::default()
            .with_rate_per_second(rate)
            .with_capacity(capacity)
            .with_ttl(Duration::from_secs(5))
            .with_prefix("test:");
        RateLimiter::new(MemoryBackend::with_clock(MockClock::default()), config).unwrap()
    }

    /// Backend that never answers.
    struct StalledBackend;

    #[async_trait]
    impl BucketBackend for StalledBackend {
        async fn refill_and_consume(&self, _key: &str, _params: &BucketParams) -> Result<Decision> {
            std::future::pending().await
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Backend that always fails.
    struct BrokenBackend;

    #[async_trait]
    impl BucketBackend for BrokenBackend {
        async fn refill_and_consume(&self, _key: &str, _params: &BucketParams) -> Result<Decision> {
            Err(FloodgateError::StoreProtocol("corrupt".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Err(FloodgateError::StoreUnavailable("down".to_string()))
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(LimiterConfig::default().validate().is_ok());
        assert!(LimiterConfig::default()
            .with_ttl(Duration::from_millis(MAX_TTL_MILLIS))
            .validate()
            .is_ok());

        let bad = [
            LimiterConfig::default().with_rate_per_second(0.0),
            LimiterConfig::default().with_rate_per_second(-1.0),
            LimiterConfig::default().with_rate_per_second(f64::NAN),
            LimiterConfig::default().with_capacity(0.0),
            LimiterConfig::default().with_capacity(f64::INFINITY),
            LimiterConfig::default().with_ttl(Duration::ZERO),
            LimiterConfig::default().with_ttl(Duration::from_micros(999)),
            LimiterConfig::default().with_ttl(Duration::MAX),
            LimiterConfig::default().with_ttl(Duration::new(18_446_744_073_709_551, 621_000_000)),
            LimiterConfig::default().with_ttl(Duration::from_millis(MAX_TTL_MILLIS + 1)),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(FloodgateError::Config(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = LimiterConfig::default().with_capacity(-3.0);
        let result = RateLimiter::new(MemoryBackend::new(), config);
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[tokio::test]
    async fn test_allow_burst_then_deny() {
        let limiter = test_limiter(1.0, 3.0);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.allow("user:burst").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.allow("user:burst").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_allow_rejects_empty_key() {
        let limiter = test_limiter(1.0, 3.0);
        let err = limiter.allow("").await.unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidKey(_)));
        assert!(limiter.backend().is_empty());
    }

    #[tokio::test]
    async fn test_allow_n() {
        let limiter = test_limiter(1.0, 5.0);

        let decision = limiter.allow_n("k", 3).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 2 });

        let decision = limiter.allow_n("k", 3).await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 2 });

        assert!(matches!(
            limiter.allow_n("k", 0).await,
            Err(FloodgateError::InvalidCost(0))
        ));
    }

    #[tokio::test]
    async fn test_reset_restores_full_bucket() {
        let limiter = test_limiter(1.0, 2.0);
        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();
        assert!(!limiter.allow("k").await.unwrap().allowed);

        limiter.reset("k").await.unwrap();
        let decision = limiter.allow("k").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 1 });
    }

    #[tokio::test]
    async fn test_store_key_uses_prefix() {
        let limiter = test_limiter(1.0, 1.0);
        assert_eq!(limiter.store_key("user:1").unwrap(), "test:user:1");
    }

    #[tokio::test]
    async fn test_backend_errors_surface() {
        let limiter = RateLimiter::new(BrokenBackend, LimiterConfig::default()).unwrap();

        let err = limiter.allow("k").await.unwrap_err();
        assert!(matches!(err, FloodgateError::StoreProtocol(_)));

        let err = limiter.reset("k").await.unwrap_err();
        assert!(matches!(err, FloodgateError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_within_times_out() {
        let limiter = RateLimiter::new(StalledBackend, LimiterConfig::default()).unwrap();

        let err = limiter
            .allow_within("k", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_n_within_times_out_as_unavailable() {
        let limiter = RateLimiter::new(StalledBackend, LimiterConfig::default()).unwrap();

        let err = limiter
            .allow_n_within("k", 3, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::StoreUnavailable(_)));
        assert!(err.is_store_error());
    }

    #[tokio::test]
    async fn test_allow_n_within_consumes_cost() {
        let limiter = test_limiter(1.0, 5.0);
        let decision = limiter
            .allow_n_within("k", 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 2 });

        assert!(matches!(
            limiter.allow_n_within("k", 0, Duration::from_secs(1)).await,
            Err(FloodgateError::InvalidCost(0))
        ));
    }

    #[tokio::test]
    async fn test_allow_within_returns_decision() {
        let limiter = test_limiter(1.0, 2.0);
        let decision = limiter
            .allow_within("k", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(decision.allowed);
    }
}
