//! Traffic scenarios for the load generator.

use std::time::Duration;

use crate::config::LoadSettings;

/// Fallback scenario length when settings ask for zero.
const DEFAULT_DURATION: Duration = Duration::from_secs(20);

/// A stretch of constant-rate traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// How long the segment lasts
    pub duration: Duration,
    /// Aggregate requests per second across all workers
    pub rps: u32,
}

impl Segment {
    /// Create a new segment.
    pub fn new(duration: Duration, rps: u32) -> Self {
        Self { duration, rps }
    }

    /// A segment that issues no requests at all.
    pub fn is_idle(&self) -> bool {
        self.rps == 0 || self.duration.is_zero()
    }

    /// Requests per second issued by one worker.
    ///
    /// The rate is split evenly; the first `rps % concurrency` workers take
    /// one extra request per second so the total still adds up when `rps`
    /// is smaller than the worker count.
    pub fn worker_rate(&self, worker: usize, concurrency: usize) -> u32 {
        let concurrency = concurrency.max(1) as u32;
        let base = self.rps / concurrency;
        let remainder = self.rps % concurrency;

        if (worker as u32) < remainder {
            base + 1
        } else {
            base
        }
    }
}

/// A named sequence of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    /// Scenario name, used in reports and key prefixes
    pub name: String,
    /// Segments run back to back
    pub segments: Vec<Segment>,
}

impl Scenario {
    /// Create a new scenario.
    pub fn new(name: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            segments,
        }
    }

    /// Sum of all segment durations.
    pub fn total_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// The built-in scenarios: steady, slow-then-burst and burst.
    pub fn builtin(settings: &LoadSettings) -> Vec<Scenario> {
        let duration = if settings.duration().is_zero() {
            DEFAULT_DURATION
        } else {
            settings.duration()
        };

        let mut slow = settings.slow_duration();
        if slow >= duration {
            slow = duration / 4;
        }

        vec![
            Scenario::new("normal", vec![Segment::new(duration, settings.normal_rps)]),
            Scenario::new(
                "slow_then_burst",
                vec![
                    Segment::new(slow, settings.slow_rps),
                    Segment::new(duration - slow, settings.burst_rps),
                ],
            ),
            Scenario::new("burst", vec![Segment::new(duration, settings.burst_rps)]),
        ]
    }

    /// Look up a built-in scenario by name.
    pub fn named(name: &str, settings: &LoadSettings) -> Option<Scenario> {
        Self::builtin(settings).into_iter().find(|s| s.name == name)
    }
}
