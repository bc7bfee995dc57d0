//! Sub-page reuse (C11, optional)
//!
//! Lets a slot within a still-active small page be reused before the whole
//! page drains, once the concurrent reclaimer's scanner has certified no
//! live pointer targets it. Depends on the `reclaim` feature: the safety
//! proof this module relies on (`PageMap::safemap`) is only ever populated
//! by the reclaimer's scan phase.

#![cfg(feature = "reclaim")]

use std::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::Allocator;
use crate::pool::{Bitmap, PageMap, Tracking};
use crate::reclaim::ScanMap;

/// Monotonically increasing global epoch, bumped once per reclaim cycle.
pub static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);

pub fn advance_epoch() -> u64 {
    GLOBAL_EPOCH.fetch_add(1, Ordering::AcqRel) + 1
}

/// Aging heuristic: a page becomes worth scanning once
/// `epochsSinceLastFree * maxAlloc / liveCount < 100`. Guards against
/// re-scanning pages whose occupancy hasn't had a chance to change.
fn is_aged(epochs_since: u64, max_alloc: u32, live_count: u32) -> bool {
    if live_count == 0 {
        return true;
    }
    (epochs_since.saturating_mul(max_alloc as u64)) / (live_count as u64) < 100
}

/// Scans every slot of `page` against `scanmap`, setting a safe bit for
/// each slot none of whose words were marked as a live pointer target.
/// Only pages whose epoch passes the aging heuristic are scanned, to avoid
/// wasted work on pages that haven't had enough churn.
pub fn scan_page(page: &PageMap, scanmap: &ScanMap, max_alloc: u32, live_count: u32) {
    let current_epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
    let page_epoch = page.epoch.load(Ordering::Acquire);
    let epochs_since = current_epoch.saturating_sub(page_epoch);
    if !is_aged(epochs_since, max_alloc, live_count) {
        return;
    }

    let alloc_size = page.alloc_size.load(Ordering::Acquire);
    if alloc_size == 0 {
        return;
    }
    let start = page.start.load(Ordering::Acquire);
    let slots = max_alloc as usize;
    let words_per_slot = (alloc_size / 8).max(1);

    let Some(safemap) = page.safemap.as_ref() else {
        return;
    };
    for slot in 0..slots {
        let slot_start = start + slot * alloc_size;
        let mut referenced = false;
        for w in 0..words_per_slot {
            if scanmap.check(slot_start + w * 8) {
                referenced = true;
                break;
            }
        }
        if !referenced {
            safemap.set(slot);
        } else {
            safemap.clear(slot);
        }
    }
    page.epoch.store(current_epoch, Ordering::Release);
}

/// Attempts to reuse a slot of `alloc_size` bytes from any small pool in
/// `arena_id` whose safemap has a free-and-safe slot for it, before
/// falling back to the ordinary bump-allocated path. Called from
/// `small::small_alloc` only when `reclaim` is both compiled in and
/// enabled at runtime.
pub fn try_reuse(alloc: &Allocator, arena_id: usize, alloc_size: usize) -> Option<std::ptr::NonNull<u8>> {
    if !alloc.options.reclaim_enabled {
        return None;
    }
    let arena = alloc.arenas.get(arena_id)?;
    let pools = arena.small_pools.lock().unwrap();
    for pool in pools.iter() {
        let Tracking::Small { pages } = &pool.tracking else {
            continue;
        };
        for page in pages.as_slice() {
            if page.alloc_size.load(Ordering::Acquire) != alloc_size {
                continue;
            }
            let Some(safemap) = page.safemap.as_ref() else {
                continue;
            };
            let slots = crate::config::page_size() / alloc_size;
            if let Some(slot) = find_reusable_slot(safemap, &page.bitmap, slots) {
                page.bitmap.set(slot);
                safemap.clear(slot);
                let addr = page.start.load(Ordering::Acquire) + slot * alloc_size;
                let p = addr as *mut u8;
                unsafe { std::ptr::write_bytes(p, 0, alloc_size) };
                alloc.stats.subpage_reuses.record(1);
                return Some(unsafe { std::ptr::NonNull::new_unchecked(p) });
            }
        }
    }
    None
}

fn find_reusable_slot(safemap: &Bitmap, occupancy: &Bitmap, slots: usize) -> Option<usize> {
    (0..slots).find(|&slot| safemap.get(slot) && !occupancy.get(slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aging_heuristic_matches_formula() {
        assert!(is_aged(1000, 64, 1));
        assert!(!is_aged(1, 64, 64));
    }
}
