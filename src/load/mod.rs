//! Load generation against a rate limiter.
//!
//! Workers issue paced `allow` calls following a [`Scenario`] and tally
//! the outcomes. Each run gets its own key prefix so repeated runs never
//! share buckets.

mod runner;
mod scenario;

pub use runner::{render_table, run_scenario, LoadStats, WARMUP_CALLS};
pub use scenario::{Scenario, Segment};

use uuid::Uuid;

/// Key prefix isolating one scenario of one run: `<base><run>:<scenario>:`.
pub fn run_prefix(base: &str, run_id: &Uuid, scenario: &str) -> String {
    format!("{}{}:{}:", base, run_id, scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_prefix_is_unique_per_run() {
        let a = run_prefix("bench:", &Uuid::new_v4(), "burst");
        let b = run_prefix("bench:", &Uuid::new_v4(), "burst");

        assert!(a.starts_with("bench:"));
        assert!(a.ends_with(":burst:"));
        assert_ne!(a, b);
    }
}
