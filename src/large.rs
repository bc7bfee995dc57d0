//! Large allocator (C6): per-lane large pools, each holding a sorted
//! boundary array over bump-carved allocations.
//!
//! Pools are grouped into `MAX_LARGE_LISTS` lanes so concurrent threads on
//! different CPUs rarely contend on the same pool's bump cursor; a thread
//! picks its lane once and keeps it for its lifetime.

use std::cell::Cell;
use std::sync::atomic::Ordering;

use log::trace;

use crate::allocator::Allocator;
use crate::config::{self, MAX_POOLS_PER_LIST};
use crate::error::{fatal, AllocError};
use crate::pool::{BoundaryStatus, LargeBoundary, Pool, PoolInner, Tracking};

thread_local! {
    static LANE: Cell<Option<usize>> = const { Cell::new(None) };
}

fn lane_for_thread() -> usize {
    LANE.with(|l| {
        if let Some(n) = l.get() {
            return n;
        }
        let lanes = config::MAX_LARGE_LISTS;
        // No portable, dependency-free CPU-affinity read; hash the thread id
        // instead, which spreads threads across lanes just as well for the
        // purpose of reducing bump-cursor contention.
        let id = format!("{:?}", std::thread::current().id());
        let hash = id.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        let lane = hash % lanes;
        l.set(Some(lane));
        lane
    })
}

fn round_to_page(size: usize) -> usize {
    let p = config::page_size();
    (size + p - 1) / p * p
}

/// Allocates a large object (`half_page < size < jumbo_threshold`).
pub fn large_alloc(alloc: &Allocator, arena_id: usize, size: usize) -> Result<std::ptr::NonNull<u8>, AllocError> {
    let size = round_to_page(size.max(1));
    let lane = lane_for_thread();
    let arena = alloc.arenas.get(arena_id).ok_or(AllocError::UnknownArena)?;
    let lane_pools = &arena.large_pools[lane];

    loop {
        let candidate = {
            let pools = lane_pools.lock().unwrap();
            pools.first().cloned()
        };
        let pool = match candidate {
            Some(p) => p,
            None => {
                let fresh = PoolInner::new_large(arena_id, &alloc.metadata, &alloc.stats)?;
                alloc.registry.add(fresh.clone());
                lane_pools.lock().unwrap().insert(0, fresh.clone());
                fresh
            }
        };

        let threshold = config::large_tail_slack_threshold();
        let base = pool.next_free_page.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            let tail_end = cur + size;
            if tail_end > pool.end {
                return None;
            }
            // Once servicing this allocation would leave less than the
            // slack threshold at the pool's tail, fold that slack into this
            // allocation instead: a stub smaller than `HALF_PAGE +
            // MIN_ALIGNMENT` is too small to satisfy another large request
            // and would otherwise sit unaccounted for until the pool is
            // retired.
            if pool.end - tail_end < threshold {
                Some(pool.end)
            } else {
                Some(tail_end)
            }
        });
        if let Ok(addr) = base {
            let tail_end = addr + size;
            let boundary = if pool.end - tail_end < threshold { pool.end } else { tail_end };
            // The array stores the boundary *after* each allocation (the new
            // `next_free_page`), not its start — the start already equals
            // the previous entry when there's no alignment padding to
            // account for, so appending it again would duplicate the slot
            // and make binary search over the array ambiguous.
            record_boundary(&pool, boundary);
            alloc.stats.large_allocs.increase(1);
            return Ok(unsafe { std::ptr::NonNull::new_unchecked(addr as *mut u8) });
        }

        // Pool's tail is exhausted: retire it from the lane's head (a later
        // free may still drain and release it) and try again with a fresh
        // pool, capped so a pathologically fragmented lane doesn't grow
        // without bound.
        let mut pools = lane_pools.lock().unwrap();
        if pools.first().map(|p| p.start) == Some(pool.start) {
            pools.remove(0);
            let at_cap = pools.len() >= MAX_POOLS_PER_LIST;
            drop(pools);
            if at_cap {
                trace!("lane {lane}: at pool cap, oldest pools rely on release to drain");
            }
            // The evicted pool may still have unallocated room at its tail
            // (it lost its spot for exceeding the per-lane cap, not for
            // actually running out of space) — release that slack now
            // rather than leaving it stranded until some unrelated free
            // happens to drain the pool.
            crate::release::release_pool_tail(alloc, &pool);
        }
    }
}

fn record_boundary(pool: &Pool, addr: usize) {
    let Tracking::Large { boundaries, .. } = &pool.tracking else {
        fatal("large_alloc target pool is not a large pool");
    };
    let idx = pool.next_free_index.fetch_add(1, Ordering::SeqCst) + 1;
    if idx >= boundaries.len() {
        fatal("large pool boundary array exhausted (pool undersized for its allocation count)");
    }
    boundaries.get(idx).addr.store(addr, Ordering::Release);
    boundaries.get(idx).status.store(0, Ordering::Release);
}

/// Frees a large allocation at `addr` within `pool`.
pub fn large_free(alloc: &Allocator, pool: &Pool, addr: usize) {
    let Tracking::Large { boundaries, .. } = &pool.tracking else {
        fatal("large_free target pool is not a large pool");
    };
    let count = pool.next_free_index.load(Ordering::Acquire) + 1;
    let slice = &boundaries.as_slice()[..count];
    let idx = match slice.binary_search_by_key(&addr, |b| b.addr.load(Ordering::Acquire)) {
        Ok(i) => i,
        Err(_) => fatal("free of a pointer that is not a live large allocation"),
    };
    let entry = &slice[idx];
    let prev = entry.status.fetch_or(BoundaryStatus::FREED.bits(), Ordering::AcqRel);
    if prev & BoundaryStatus::FREED.bits() != 0 {
        fatal("double free of a large allocation");
    }
    alloc.stats.large_allocs.decrease(1);

    let (lo, hi) = coalesce_run(slice, idx, pool);
    if hi > lo {
        crate::release::release_large_run(alloc, pool, lo, hi);
    }
}

/// Walks left/right from `idx` over contiguous freed-and-not-yet-unmapped
/// boundary entries, returning the address span of the maximal run
/// containing `idx`.
fn coalesce_run(slice: &[LargeBoundary], idx: usize, pool: &Pool) -> (usize, usize) {
    let is_free = |s: &BoundaryStatus| s.contains(BoundaryStatus::FREED) && !s.contains(BoundaryStatus::UNMAPPED);

    let mut lo_idx = idx;
    while lo_idx > 0 {
        let st = BoundaryStatus::from_bits_truncate(slice[lo_idx - 1].status.load(Ordering::Acquire));
        if is_free(&st) {
            lo_idx -= 1;
        } else {
            break;
        }
    }
    let mut hi_idx = idx;
    while hi_idx + 1 < slice.len() {
        let st = BoundaryStatus::from_bits_truncate(slice[hi_idx + 1].status.load(Ordering::Acquire));
        if is_free(&st) {
            hi_idx += 1;
        } else {
            break;
        }
    }
    let lo = slice[lo_idx].addr.load(Ordering::Acquire);
    let hi = if hi_idx + 1 < slice.len() {
        slice[hi_idx + 1].addr.load(Ordering::Acquire)
    } else {
        pool.next_free_page.load(Ordering::Acquire)
    };
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;

    #[test]
    fn large_alloc_then_free_round_trips() {
        let alloc = Allocator::new_for_test();
        let ptr = large_alloc(&alloc, 0, config::half_page() + 16).unwrap();
        let pool = alloc.registry.find_pool(ptr.as_ptr() as usize).unwrap();
        large_free(&alloc, &pool, ptr.as_ptr() as usize);
    }
}
