//! Configuration management for Floodgate.
//!
//! Settings are layered: serde defaults, then an optional YAML file, then
//! environment variables prefixed with `FLOODGATE` using `__` between
//! sections (e.g. `FLOODGATE_LIMITER__CAPACITY=20`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::LimiterConfig;

/// Environment variable prefix.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate harness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Store connection
    #[serde(default)]
    pub redis: RedisSettings,

    /// Limiter parameters
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Load generator parameters
    #[serde(default)]
    pub load: LoadSettings,
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long to wait for the server to answer PING at start-up
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
        }
    }
}

impl RedisSettings {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Readiness timeout as a duration.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_ready_timeout_ms() -> u64 {
    2000
}

/// Limiter parameters as they appear in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Tokens per second
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,

    /// Maximum burst
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Inactivity expiry in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Key namespace
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            rate_per_second: default_rate_per_second(),
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
            prefix: default_prefix(),
        }
    }
}

impl LimiterSettings {
    /// Convert into a validated limiter configuration.
    pub fn to_limiter_config(&self) -> Result<LimiterConfig> {
        let config = LimiterConfig::default()
            .with_rate_per_second(self.rate_per_second)
            .with_capacity(self.capacity)
            .with_ttl(Duration::from_millis(self.ttl_ms))
            .with_prefix(self.prefix.clone());
        config.validate()?;
        Ok(config)
    }
}

fn default_rate_per_second() -> f64 {
    100.0
}

fn default_capacity() -> f64 {
    100.0
}

fn default_ttl_ms() -> u64 {
    3_600_000
}

fn default_prefix() -> String {
    "floodgate:rl:".to_string()
}

/// Load generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSettings {
    /// Concurrent workers per scenario
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Length of each scenario in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Steady request rate of the `normal` scenario
    #[serde(default = "default_normal_rps")]
    pub normal_rps: u32,

    /// Request rate of the slow phase of `slow_then_burst`
    #[serde(default = "default_slow_rps")]
    pub slow_rps: u32,

    /// Length of the slow phase in milliseconds
    #[serde(default = "default_slow_duration_ms")]
    pub slow_duration_ms: u64,

    /// Request rate of burst phases
    #[serde(default = "default_burst_rps")]
    pub burst_rps: u32,

    /// Caller key every worker hits
    #[serde(default = "default_load_key")]
    pub key: String,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            duration_ms: default_duration_ms(),
            normal_rps: default_normal_rps(),
            slow_rps: default_slow_rps(),
            slow_duration_ms: default_slow_duration_ms(),
            burst_rps: default_burst_rps(),
            key: default_load_key(),
        }
    }
}

impl LoadSettings {
    /// Scenario length as a duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Slow phase length as a duration.
    pub fn slow_duration(&self) -> Duration {
        Duration::from_millis(self.slow_duration_ms)
    }
}

fn default_concurrency() -> usize {
    50
}

fn default_duration_ms() -> u64 {
    20_000
}

fn default_normal_rps() -> u32 {
    100
}

fn default_slow_rps() -> u32 {
    10
}

fn default_slow_duration_ms() -> u64 {
    5_000
}

fn default_burst_rps() -> u32 {
    1000
}

fn default_load_key() -> String {
    "user:bench".to_string()
}

impl Settings {
    /// Load settings from an optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(format!("Failed to load settings: {}", e)))
    }

    /// Load settings from a YAML file without consulting the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse settings: {}", e)))
    }
}
