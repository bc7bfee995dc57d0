//! Allocator-wide statistics. `StatCount`/`StatCounter`/`Stats` track
//! running counts and peaks over stable `std::sync::atomic` primitives.
//!
//! This module deliberately stops at a plain-data `snapshot()`; it does not
//! grow into a printf-style reporter.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A running count with peak tracking, e.g. "bytes reserved".
#[derive(Default)]
pub struct StatCount {
    allocated: AtomicU64,
    freed: AtomicU64,
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
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount as u64, Ordering::Relaxed);
        } else {
            self.freed.fetch_add((-amount) as u64, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Cumulative count of increases ever recorded (e.g. total number of
    /// small allocations ever made), used by the reclaimer's rate
    /// scheduler rather than `current()`, which nets frees out.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> StatCountSnapshot {
        StatCountSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatCountSnapshot {
    pub allocated: u64,
    pub freed: u64,
    pub current: i64,
    pub peak: i64,
}

/// A simple monotonically-increasing counter, e.g. "number of mmap calls".
#[derive(Default)]
pub struct StatCounter {
    total: AtomicU64,
    count: AtomicU64,
}

impl StatCounter {
    pub fn record(&self, amount: u64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Process-wide statistics, one instance per [`crate::allocator::Allocator`].
#[derive(Default)]
pub struct Stats {
    pub pools: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub released: StatCount,
    pub arenas: StatCount,
    pub threads: StatCount,
    pub jumbo: StatCount,
    pub small_allocs: StatCount,
    pub large_allocs: StatCount,
    pub mmap_calls: StatCounter,
    pub commit_calls: StatCounter,
    pub reclaim_cycles: StatCounter,
    pub reclaimed_bytes: StatCount,
    /// Sub-page slot reuses (C11): distinct from `reclaimed_bytes`, which
    /// tracks whole pools the reclaimer (C10) has returned to the reuse
    /// queue.
    pub subpage_reuses: StatCounter,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub pools: StatCountSnapshot,
    pub pages: StatCountSnapshot,
    pub reserved: StatCountSnapshot,
    pub committed: StatCountSnapshot,
    pub released: StatCountSnapshot,
    pub arenas: StatCountSnapshot,
    pub threads: StatCountSnapshot,
    pub jumbo: StatCountSnapshot,
    pub small_allocs: StatCountSnapshot,
    pub large_allocs: StatCountSnapshot,
    pub mmap_calls: u64,
    pub commit_calls: u64,
    pub reclaim_cycles: u64,
    pub reclaimed_bytes: StatCountSnapshot,
    pub subpage_reuses: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pools: self.pools.snapshot(),
            pages: self.pages.snapshot(),
            reserved: self.reserved.snapshot(),
            committed: self.committed.snapshot(),
            released: self.released.snapshot(),
            arenas: self.arenas.snapshot(),
            threads: self.threads.snapshot(),
            jumbo: self.jumbo.snapshot(),
            small_allocs: self.small_allocs.snapshot(),
            large_allocs: self.large_allocs.snapshot(),
            mmap_calls: self.mmap_calls.count(),
            commit_calls: self.commit_calls.count(),
            reclaim_cycles: self.reclaim_cycles.count(),
            reclaimed_bytes: self.reclaimed_bytes.snapshot(),
            subpage_reuses: self.subpage_reuses.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_count_tracks_peak() {
        let s = StatCount::default();
        s.increase(100);
        s.increase(50);
        s.decrease(80);
        assert_eq!(s.current(), 70);
        assert_eq!(s.peak(), 150);
    }
}
