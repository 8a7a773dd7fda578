//! Floodgate - Distributed Token-Bucket Rate Limiting
//!
//! This crate implements a token-bucket rate limiter whose state lives
//! entirely in a shared Redis server. Every decision is one atomic script
//! execution, so any number of tasks and service replicas can share a
//! bucket without local locking.
//!
//! ```no_run
//! use floodgate::ratelimit::{LimiterConfig, RateLimiter, RedisBackend};
//! use std::time::Duration;
//!
//! # async fn run() -> floodgate::error::Result<()> {
//! let backend = RedisBackend::connect("redis://127.0.0.1:6379/").await?;
//! let config = LimiterConfig::default()
//!     .with_rate_per_second(5.0)
//!     .with_capacity(10.0)
//!     .with_ttl(Duration::from_secs(3600))
//!     .with_prefix("myapp:rl:");
//! let limiter = RateLimiter::new(backend, config)?;
//!
//! let decision = limiter.allow("user:123").await?;
//! println!("allowed: {}, remaining: {}", decision.allowed, decision.remaining);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod load;
pub mod ratelimit;
