//! In-process bucket backend.
//!
//! Buckets live in a `DashMap`. The entry guard holds the shard write lock
//! for the whole refill-and-consume step, which is what makes the step
//! atomic per key. Different keys on different shards proceed in parallel.
//! State is only shared between limiters that hold clones of the same
//! backend, so this is for tests and single-process use.
//!
//! Expired buckets are swept every [`SWEEP_EVERY_WRITES`] writes; call
//! [`MemoryBackend::purge_expired`] to sweep sooner.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::BucketBackend;
use super::bucket::{BucketParams, BucketState, Decision};
use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// Writes between opportunistic sweeps of expired buckets.
pub const SWEEP_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BucketState,
    /// `None` when the deadline lies beyond what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// A bucket backend held in process memory.
pub struct MemoryBackend<C: Clock = SystemClock> {
    slots: Arc<DashMap<String, Slot>>,
    writes: Arc<AtomicU64>,
    clock: C,
}

impl MemoryBackend<SystemClock> {
    /// Create an empty backend driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }
}

impl Default for MemoryBackend<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryBackend<C> {
    /// Create an empty backend driven by `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Number of stored buckets, including ones that expired but have not
    /// been purged yet.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no buckets are stored.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Token count of a live bucket, as last written.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.state.tokens())
    }

    /// Drop every expired bucket. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.slots.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired buckets");
        }
        removed
    }
}

impl<C: Clock + Clone> Clone for MemoryBackend<C> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            writes: Arc::clone(&self.writes),
            clock: self.clock.clone(),
        }
    }
}

impl<C: Clock> std::fmt::Debug for MemoryBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("buckets", &self.slots.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: Clock> BucketBackend for MemoryBackend<C> {
    async fn refill_and_consume(&self, key: &str, params: &BucketParams) -> Result<Decision> {
        let now = self.clock.now();
        let expires_at = now.checked_add(Duration::from_millis(params.ttl_millis()));

        let decision = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_expired(now) {
                    slot.state = BucketState::fresh(params.capacity, now);
                }
                let decision = slot.state.refill_and_consume(now, params);
                slot.expires_at = expires_at;
                decision
            }
            Entry::Vacant(vacant) => {
                let mut state = BucketState::fresh(params.capacity, now);
                let decision = state.refill_and_consume(now, params);
                vacant.insert(Slot { state, expires_at });
                decision
            }
        };

        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Bucket updated in memory"
        );

        // The entry guard is gone; retain may now take every shard lock.
        let written = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if written % SWEEP_EVERY_WRITES == 0 {
            self.purge_expired();
        }

        Ok(decision)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }
}
