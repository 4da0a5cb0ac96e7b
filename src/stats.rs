//! Atomic counters for arena and recycler diagnostics.
//!
//! A monotonic allocated/freed pair plus a live `current` value and
//! its observed `peak`, updated with `Ordering::Relaxed` since only
//! the eventual value matters, never the interleaving of updates with
//! anything else.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Tracks a quantity that grows and shrinks: allocated/freed totals plus
/// the current live value and its historical peak.
#[derive(Debug, Default)]
pub struct StatCount {
    allocated: AtomicI64,
    freed: AtomicI64,
    current: AtomicI64,
    peak: AtomicI64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> i64 {
        self.freed.load(Ordering::Relaxed)
    }
}

/// A plain occurrence counter (e.g. "number of chunk list searches").
#[derive(Debug, Default)]
pub struct StatCounter {
    total: AtomicUsize,
}

impl StatCounter {
    pub fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

/// Arena-wide counters. Tiny/Small/Huge paths update these outside the
/// arena guard (see the locking discipline in `arena.rs`), which is why
/// they have to be atomic; Normal-path chunk list bookkeeping happens
/// under the guard and is plain integer state owned by `ChunkList`.
#[derive(Debug, Default)]
pub struct ArenaStats {
    pub tiny: StatCount,
    pub small: StatCount,
    pub normal: StatCount,
    pub huge: StatCount,
    pub chunks_created: StatCounter,
    pub chunks_destroyed: StatCounter,
    pub list_searches: StatCounter,
}

/// Recycler counters: how many objects are currently resident in
/// thread-local stacks vs. in transit through a cross-thread queue.
#[derive(Debug, Default)]
pub struct RecyclerStats {
    pub pooled: StatCount,
    pub in_transit: StatCount,
    pub dropped_saturated: StatCounter,
}

/// A point-in-time, plain-data snapshot of arena occupancy, suitable
/// for a diagnostics endpoint or periodic logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaMetrics {
    pub chunks_per_band: [usize; 6],
    pub tiny_rings_nonempty: usize,
    pub small_rings_nonempty: usize,
    pub tiny_allocated: i64,
    pub small_allocated: i64,
    pub normal_allocated: i64,
    pub huge_allocated: i64,
    pub chunks_created: usize,
    pub chunks_destroyed: usize,
}
