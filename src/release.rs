//! Page-release engine (C8): unmaps contiguous freed page runs back to the
//! OS, advancing `start_in_use`/`end_in_use` but never recycling the
//! addresses for different content (release monotonicity:
//! `start_in_use` only ever advances, `end_in_use` only ever retreats).

use std::sync::atomic::Ordering;

use log::debug;

use crate::allocator::Allocator;
use crate::config;
use crate::pool::{LargeBoundary, Pool, Tracking};

/// Called when a small page's bitmap has gone fully to zero after being
/// full at least once. Marks the page released and, if this drains the
/// pool's entire still-live span, unmaps it and retires it from the arena.
pub fn release_small_page(alloc: &Allocator, pool: &Pool, page_index: usize) {
    let page_size = config::page_size();
    let Tracking::Small { pages } = &pool.tracking else {
        return;
    };
    let page = pages.get(page_index);
    let start = page.start.load(Ordering::Acquire);

    let _guard = pool.lock.lock().unwrap();
    if crate::os::unmap_or_protnone(start, page_size, &alloc.stats) {
        page.set_status(crate::pool::PageStatus::RELEASED);
        alloc.stats.pages.decrease(1);
    }

    advance_in_use_from_front(pool, pages.len(), page_size, |i| {
        pages.get(i).status().contains(crate::pool::PageStatus::RELEASED)
    });

    maybe_retire_pool(alloc, pool);
}

/// Large-pool counterpart: called when neighbouring boundary slots coalesce
/// into a single freed run spanning at least [`crate::config::Options::min_pages_to_free`]
/// pages.
pub fn release_large_run(alloc: &Allocator, pool: &Pool, lo: usize, hi_addr: usize) {
    let page_size = config::page_size();
    let run_len = hi_addr - lo;
    if run_len / page_size < crate::config::options().min_pages_to_free {
        return;
    }
    let _guard = pool.lock.lock().unwrap();
    if crate::os::unmap_or_protnone(lo, run_len, &alloc.stats) {
        if let Tracking::Large { boundaries, .. } = &pool.tracking {
            mark_boundaries_unmapped(boundaries.as_slice(), lo, hi_addr);
        }
        advance_in_use_for_range(pool, lo, hi_addr);
    }
    maybe_retire_pool(alloc, pool);
}

/// Advances `start_in_use`/`end_in_use` for a large pool's just-unmapped
/// run `[lo, hi)`: if the run abuts the current front, `start_in_use` jumps
/// to `hi`; if it abuts the current back, `end_in_use` retreats to `lo`.
/// Both can fire for the same run when it is the pool's entire remaining
/// live span, which is exactly the "they meet" drain condition.
fn advance_in_use_for_range(pool: &Pool, lo: usize, hi: usize) {
    let _ = pool.start_in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        if cur == lo { Some(hi) } else { None }
    });
    let _ = pool.end_in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        if cur == hi { Some(lo) } else { None }
    });
}

fn mark_boundaries_unmapped(boundaries: &[LargeBoundary], lo: usize, hi: usize) {
    for b in boundaries {
        let addr = b.addr.load(Ordering::Acquire);
        if addr >= lo && addr < hi {
            b.status.fetch_or(
                crate::pool::BoundaryStatus::UNMAPPED.bits(),
                Ordering::AcqRel,
            );
        }
    }
}

/// Advances `start_in_use` forward over any prefix of released pages: once a
/// page at the front is released, the in-use window can never grow to cover
/// it again (forward-only release order).
fn advance_in_use_from_front(pool: &Pool, n_pages: usize, page_size: usize, released: impl Fn(usize) -> bool) {
    loop {
        let cur = pool.start_in_use.load(Ordering::Acquire);
        let idx = (cur - pool.start) / page_size;
        if idx >= n_pages || !released(idx) {
            break;
        }
        let next = cur + page_size;
        if pool
            .start_in_use
            .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            break;
        }
    }
}

/// Releases the unused tail `[next_free_page, end)` of a large pool that is
/// being evicted from its lane for exceeding the per-lane pool cap (§4.5:
/// "the head pool is retired (its slack recorded and released)"). Unlike
/// [`release_large_run`], this range was never handed out as an allocation,
/// so there are no boundary entries to mark unmapped — only `end_in_use`
/// retreats.
pub(crate) fn release_pool_tail(alloc: &Allocator, pool: &Pool) {
    let tail_start = pool.next_free_page.load(Ordering::Acquire);
    let tail_end = pool.end;
    if tail_end <= tail_start {
        return;
    }
    let _guard = pool.lock.lock().unwrap();
    if crate::os::unmap_or_protnone(tail_start, tail_end - tail_start, &alloc.stats) {
        let _ = pool.end_in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            if cur > tail_start { Some(tail_start) } else { None }
        });
    }
    maybe_retire_pool(alloc, pool);
}

fn maybe_retire_pool(alloc: &Allocator, pool: &Pool) {
    if !pool.is_drained() {
        return;
    }
    if unlist_from_arena(alloc, pool) {
        alloc.registry.remove(pool);
        alloc.stats.pools.decrease(1);
        debug!("arena {}: retired drained pool at {:#x}", pool.arena, pool.start);
    }
}

/// Removes `pool` from whichever of its arena's pool lists it lives in
/// (small / the matching large lane / jumbo), without touching the
/// registry or stats. Shared by this module's own drain-triggered
/// retirement and by the reclaimer (`reclaim::retire_reclaimed`), which
/// additionally has to unlist a pool that is *not yet* drained in the C8
/// sense but has been proven unreachable by the scanner.
pub(crate) fn unlist_from_arena(alloc: &Allocator, pool: &Pool) -> bool {
    let arena = match alloc.arenas.get(pool.arena) {
        Some(a) => a,
        None => return false,
    };
    match pool.kind {
        crate::pool::PoolKind::Small => {
            let mut pools = arena.small_pools.lock().unwrap();
            remove_one(&mut pools, pool)
        }
        crate::pool::PoolKind::Large => {
            for lane in &arena.large_pools {
                let mut pools = lane.lock().unwrap();
                if remove_one(&mut pools, pool) {
                    return true;
                }
            }
            false
        }
        crate::pool::PoolKind::Jumbo => {
            let mut pools = arena.jumbo_pools.lock().unwrap();
            remove_one(&mut pools, pool)
        }
    }
}

/// Removes `target` from `pools` by identity, used both by this module's
/// own retirement path and by the reclaimer (`reclaim::retire_reclaimed`)
/// once it has proven a pool unreachable.
pub(crate) fn remove_one(pools: &mut Vec<Pool>, target: &Pool) -> bool {
    if let Some(idx) = pools.iter().position(|p| std::sync::Arc::ptr_eq(p, target)) {
        pools.swap_remove(idx);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;

    #[test]
    fn releasing_every_page_drains_and_retires_a_small_pool() {
        let alloc = Allocator::new_for_test();
        let pool = {
            let arena = alloc.arenas.default_arena();
            arena.small_pools.lock().unwrap().first().unwrap().clone()
        };
        let page_size = config::page_size();
        let n_pages = (pool.end - pool.start) / page_size;
        if let Tracking::Small { pages } = &pool.tracking {
            for i in 0..n_pages {
                pages.get(i).reinit(pool.start + i * page_size, 16, page_size / 16);
                pages.get(i).set_status(crate::pool::PageStatus::FULL);
            }
        }
        for i in 0..n_pages {
            release_small_page(&alloc, &pool, i);
        }
        assert!(pool.is_drained());
    }

    #[test]
    fn freeing_whole_large_pool_span_drains_and_retires_it() {
        let alloc = Allocator::new_for_test();
        // Big enough that rounding up to a whole page pushes the tail-slack
        // remaining in the pool under `large_tail_slack_threshold`, which
        // folds it into this allocation: its boundary lands exactly at
        // `pool.end`, so the single allocation really does span the pool's
        // entire live range.
        let size = config::POOL_SIZE - config::page_size() + 1;
        let ptr = crate::large::large_alloc(&alloc, 0, size).unwrap();
        let pool = alloc.registry.find_pool(ptr.as_ptr() as usize).unwrap();
        assert!(!pool.is_drained());
        crate::large::large_free(&alloc, &pool, ptr.as_ptr() as usize);
        // The single allocation spans the pool's entire live range, so
        // freeing it unmaps a run that abuts both the front and the back.
        assert!(pool.is_drained());
    }
}
