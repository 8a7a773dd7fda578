//! Paced load runner.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use super::scenario::{Scenario, Segment};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{BucketBackend, Decision, RateLimiter};

/// Calls made before measuring, to load the script and warm connections.
pub const WARMUP_CALLS: usize = 100;

/// Outcome counts for one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStats {
    /// Scenario name
    pub scenario: String,
    /// Calls issued
    pub total: u64,
    /// Calls admitted
    pub allowed: u64,
    /// Calls rejected by the limiter
    pub denied: u64,
    /// Calls that failed with an error
    pub errors: u64,
    /// Wall-clock time of the measured run
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl LoadStats {
    /// Achieved request throughput.
    pub fn requests_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Result<Decision>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Ok(decision) if decision.allowed => &self.allowed,
            Ok(_) => &self.denied,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, scenario: &str, duration: Duration) -> LoadStats {
        LoadStats {
            scenario: scenario.to_string(),
            total: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            duration,
        }
    }
}

/// Drive `limiter` with the traffic shape of `scenario`.
///
/// `concurrency` workers share the load, all hitting the same `key`.
/// Dropping the returned future aborts every worker.
pub async fn run_scenario<B>(
    limiter: &RateLimiter<B>,
    key: &str,
    scenario: &Scenario,
    concurrency: usize,
) -> Result<LoadStats>
where
    B: BucketBackend + Clone + 'static,
{
    if concurrency == 0 {
        return Err(FloodgateError::Config(
            "concurrency must be at least 1".to_string(),
        ));
    }

    for _ in 0..WARMUP_CALLS {
        let _ = limiter.allow(key).await;
    }

    info!(
        scenario = %scenario.name,
        concurrency = concurrency,
        duration = ?scenario.total_duration(),
        "Running scenario"
    );

    let counters = Arc::new(Counters::default());
    let started = Instant::now();

    let mut workers = JoinSet::new();
    for worker in 0..concurrency {
        workers.spawn(run_worker(
            limiter.clone(),
            key.to_string(),
            scenario.segments.clone(),
            worker,
            concurrency,
            Arc::clone(&counters),
        ));
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Load worker failed");
        }
    }

    let stats = counters.snapshot(&scenario.name, started.elapsed());

    info!(
        scenario = %stats.scenario,
        total = stats.total,
        allowed = stats.allowed,
        denied = stats.denied,
        errors = stats.errors,
        duration = ?stats.duration,
        "Scenario finished"
    );

    Ok(stats)
}

async fn run_worker<B: BucketBackend>(
    limiter: RateLimiter<B>,
    key: String,
    segments: Vec<Segment>,
    worker: usize,
    concurrency: usize,
    counters: Arc<Counters>,
) {
    for segment in segments {
        if segment.is_idle() {
            continue;
        }

        let rate = segment.worker_rate(worker, concurrency);
        if rate == 0 {
            tokio::time::sleep(segment.duration).await;
            continue;
        }

        let interval = Duration::from_secs(1) / rate;
        let start = Instant::now();
        let end = start + segment.duration;

        for tick in 0u32.. {
            let next = start + interval * tick;
            if next > end {
                break;
            }
            tokio::time::sleep_until(next).await;

            let outcome = limiter.allow(&key).await;
            counters.record(&outcome);
        }
    }
}

/// Render stats as a fixed-width table.
pub fn render_table(rows: &[LoadStats]) -> String {
    let mut out = format!(
        "{:<18} | {:>10} | {:>10} | {:>10} | {:>8} | {:>9}\n",
        "scenario", "total", "allowed", "denied", "errs", "req/s"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');

    for row in rows {
        out.push_str(&format!(
            "{:<18} | {:>10} | {:>10} | {:>10} | {:>8} | {:>9.1}\n",
            row.scenario,
            row.total,
            row.allowed,
            row.denied,
            row.errors,
            row.requests_per_second()
        ));
    }
    out
}
