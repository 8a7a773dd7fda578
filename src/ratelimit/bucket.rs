//! Token bucket state and the refill-and-consume step.
//!
//! The arithmetic here is the single source of truth for the algorithm. The
//! in-process backend runs it directly under a per-key lock, and the Redis
//! script in [`super::redis_backend`] is a line-for-line port of it.

use serde::Serialize;
use std::time::{Duration, Instant};

/// The outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket after this call (floored)
    pub remaining: u64,
}

impl Decision {
    /// Build a decision from a fractional token count.
    pub fn from_tokens(allowed: bool, tokens: f64) -> Self {
        Self {
            allowed,
            remaining: floor_tokens(tokens),
        }
    }
}

/// Longest accepted TTL in milliseconds. Redis rejects expiries whose
/// absolute deadline overflows a signed 64-bit millisecond count.
pub const MAX_TTL_MILLIS: u64 = (i64::MAX / 2) as u64;

/// Per-call parameters handed to a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Tokens added per elapsed second
    pub rate_per_second: f64,
    /// Maximum tokens the bucket holds
    pub capacity: f64,
    /// Inactivity expiry, refreshed on every write
    pub ttl: Duration,
    /// Tokens consumed by an admitted call
    pub cost: u32,
}

impl BucketParams {
    /// TTL in whole milliseconds, clamped to `1..=MAX_TTL_MILLIS`.
    pub fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis())
            .unwrap_or(u64::MAX)
            .clamp(1, MAX_TTL_MILLIS)
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
}

impl BucketState {
    /// A bucket that has never been used: full, refilled as of `now`.
    pub fn fresh(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill_at: now,
        }
    }

    /// Current (possibly fractional) token count.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// When the bucket was last refilled.
    pub fn last_refill_at(&self) -> Instant {
        self.last_refill_at
    }

    /// Add the tokens accrued since the last refill, capped at capacity.
    ///
    /// A `now` earlier than the last refill adds nothing and does not move
    /// the refill clock backwards.
    pub fn refill(&mut self, now: Instant, params: &BucketParams) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        let accrued = elapsed.as_secs_f64() * params.rate_per_second;
        self.tokens = (self.tokens + accrued).min(params.capacity);

        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    /// Take `cost` tokens if available. A deny leaves the count untouched.
    pub fn try_consume(&mut self, cost: u32) -> Decision {
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            Decision::from_tokens(true, self.tokens)
        } else {
            Decision::from_tokens(false, self.tokens)
        }
    }

    /// Refill then consume, as one step.
    pub fn refill_and_consume(&mut self, now: Instant, params: &BucketParams) -> Decision {
        self.refill(now, params);
        self.try_consume(params.cost)
    }
}

/// Floor a token count to a non-negative integer.
fn floor_tokens(tokens: f64) -> u64 {
    if tokens.is_finite() && tokens > 0.0 {
        tokens.floor() as u64
    } else {
        0
    }
}
