//! Redis-backed bucket storage.
//!
//! Every decision is one `EVALSHA` of [`REFILL_AND_CONSUME`]. Redis runs
//! scripts one at a time, so the read, refill, consume and write for a key
//! happen as a single step from the point of view of every other client,
//! across any number of service replicas.
//!
//! ## Layout
//!
//! - Key: `<prefix><caller key>`
//! - Value: hash with `tokens` (float) and `ts` (store time, microseconds)
//! - Expiry: `PEXPIRE ttl`, refreshed on every call
//!
//! Time comes from the store's `TIME`, so replicas with skewed clocks agree
//! on elapsed time.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::backend::BucketBackend;
use super::bucket::{BucketParams, Decision};
use crate::error::{FloodgateError, Result};

/// Server-side refill-and-consume, mirroring `BucketState::refill_and_consume`.
///
/// KEYS[1] is the bucket key. ARGV is rate per second, capacity, ttl in
/// milliseconds and cost. Returns `{allowed, floor(tokens)}`.
pub const REFILL_AND_CONSUME: &str = r#"
redis.replicate_commands()

local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

if ttl_ms == nil or ttl_ms < 1 or ttl_ms > 4611686018427387903 then
  return redis.error_reply('ERR ttl out of range: ' .. tostring(ARGV[3]))
end

local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000000 + tonumber(time[2])

local fields = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = capacity
local last = now
if fields[1] or fields[2] then
  tokens = tonumber(fields[1])
  last = tonumber(fields[2])
  if tokens == nil or last == nil or tokens ~= tokens or tokens < 0 then
    return redis.error_reply('CORRUPT bucket state at ' .. KEYS[1])
  end
end

local elapsed = math.max(0, now - last) / 1000000
tokens = math.min(capacity, tokens + elapsed * rate)
if now > last then
  last = now
end

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', string.format('%.17g', tokens), 'ts', string.format('%.17g', last))
redis.call('PEXPIRE', KEYS[1], ttl_ms)

return {allowed, math.floor(tokens)}
"#;

/// Interval between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Redis-backed bucket storage shared by every limiter pointed at the same
/// server.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    script: Arc<Script>,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("script_hash", &self.script.get_hash())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379/")
    ///
    /// # Errors
    /// Returns `Config` for a malformed URL and `StoreUnavailable` if the
    /// server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| FloodgateError::Config(format!("Invalid Redis URL {}: {}", url, e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(classify_error)?;

        info!(url = %url, "Connected to Redis");

        Ok(Self::from_connection(connection))
    }

    /// Connect, giving up once `timeout` elapses.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| {
                FloodgateError::StoreUnavailable(format!(
                    "timed out after {:?} connecting to {}",
                    timeout, url
                ))
            })?
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Arc::new(Script::new(REFILL_AND_CONSUME)),
        }
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify_error)?;

        if pong != "PONG" {
            return Err(FloodgateError::StoreProtocol(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }

    /// Poll the server until it answers or `timeout` elapses.
    ///
    /// Intended for harness start-up while Redis may still be booting.
    /// `allow` itself never retries.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = tokio::time::timeout(remaining, self.ping()).await;

            let err = match attempt {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => FloodgateError::StoreUnavailable("PING timed out".to_string()),
            };

            if Instant::now() + READY_POLL_INTERVAL >= deadline {
                warn!(error = %err, "Redis did not become ready in time");
                return Err(err);
            }

            debug!(error = %err, "Redis not ready yet, retrying");
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BucketBackend for RedisBackend {
    async fn refill_and_consume(&self, key: &str, params: &BucketParams) -> Result<Decision> {
        let mut conn = self.connection.clone();

        let (allowed, remaining): (i64, i64) = self
            .script
            .key(key)
            .arg(params.rate_per_second)
            .arg(params.capacity)
            .arg(params.ttl_millis())
            .arg(params.cost)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Bucket script failed");
                classify_error(e)
            })?;

        let decision = decode_reply(allowed, remaining)?;

        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Bucket updated in Redis"
        );

        Ok(decision)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(classify_error)?;
        debug!(key = %key, "Bucket reset");
        Ok(())
    }
}

/// Validate the script's reply shape.
fn decode_reply(allowed: i64, remaining: i64) -> Result<Decision> {
    let allowed = match allowed {
        0 => false,
        1 => true,
        other => {
            return Err(FloodgateError::StoreProtocol(format!(
                "allowed flag out of range: {}",
                other
            )))
        }
    };

    let remaining = u64::try_from(remaining).map_err(|_| {
        FloodgateError::StoreProtocol(format!("negative remaining tokens: {}", remaining))
    })?;

    Ok(Decision { allowed, remaining })
}

/// Sort a Redis failure into unavailable (transport) or protocol (data).
fn classify_error(err: RedisError) -> FloodgateError {
    let unavailable = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
                | ErrorKind::AuthenticationFailed
        );

    if unavailable {
        FloodgateError::StoreUnavailable(err.to_string())
    } else {
        FloodgateError::StoreProtocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::MAX_TTL_MILLIS;

    #[test]
    fn test_decode_reply() {
        assert_eq!(
            decode_reply(1, 4).unwrap(),
            Decision { allowed: true, remaining: 4 }
        );
        assert_eq!(
            decode_reply(0, 0).unwrap(),
            Decision { allowed: false, remaining: 0 }
        );
    }

    #[test]
    fn test_decode_reply_rejects_garbage() {
        assert!(matches!(
            decode_reply(2, 0),
            Err(FloodgateError::StoreProtocol(_))
        ));
        assert!(matches!(
            decode_reply(1, -1),
            Err(FloodgateError::StoreProtocol(_))
        ));
    }

    #[test]
    fn test_classify_io_error_as_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_error(RedisError::from(io));
        assert!(matches!(err, FloodgateError::StoreUnavailable(_)));
    }

    #[test]
    fn test_classify_type_error_as_protocol() {
        let err = classify_error(RedisError::from((ErrorKind::TypeError, "bad reply")));
        assert!(matches!(err, FloodgateError::StoreProtocol(_)));
    }

    #[test]
    fn test_classify_loading_as_unavailable() {
        let err = classify_error(RedisError::from((ErrorKind::BusyLoadingError, "loading")));
        assert!(matches!(err, FloodgateError::StoreUnavailable(_)));
    }

    #[test]
    fn test_script_mentions_every_argument() {
        for arg in ["ARGV[1]", "ARGV[2]", "ARGV[3]", "ARGV[4]", "KEYS[1]", "PEXPIRE", "TIME"] {
            assert!(REFILL_AND_CONSUME.contains(arg), "script missing {}", arg);
        }
    }

    #[test]
    fn test_script_checks_ttl_before_writing() {
        let guard = REFILL_AND_CONSUME.find("ttl out of range").unwrap();
        let write = REFILL_AND_CONSUME.find("'HSET'").unwrap();
        assert!(guard < write);
        assert!(REFILL_AND_CONSUME.contains(&MAX_TTL_MILLIS.to_string()));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let err = RedisBackend::connect("not a url").await.unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unavailable() {
        let err = RedisBackend::connect_with_timeout("redis://127.0.0.1:1/", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_store_error());
    }
}
