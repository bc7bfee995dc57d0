//! Small-allocation path (C5 + the small-pool half of C4)
//!
//! Size classing: bins cover sizes up to a half page, split into a
//! "stride" region (fixed multiples of the alignment — good page
//! utilization trivially, used for the smallest requests) and a
//! "max-packed" region (`floor(page_size / count)` for small counts,
//! rounded down to alignment — maximizes page utilization for the larger
//! small-size classes). The exact interleaving of the two families is an
//! engineering decision recorded in DESIGN.md.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use log::trace;

use crate::allocator::Allocator;
use crate::config::{self, BIN_COUNT, INFLECTION, MIN_ALIGNMENT, PAGES_PER_REFILL};
use crate::error::{fatal, AllocError};
use crate::pool::{Pool, Tracking};

/// Ascending table of small-bin allocation sizes, built once the page size
/// is known.
pub struct SizeClasses {
    sizes: Vec<usize>,
}

impl SizeClasses {
    fn build() -> Self {
        let align = MIN_ALIGNMENT;
        let page = config::page_size();
        let half = page / 2;
        let mut set = std::collections::BTreeSet::new();

        let stride_count = BIN_COUNT.saturating_sub(INFLECTION);
        for k in 1..=stride_count {
            let s = align * k;
            if s <= half {
                set.insert(s);
            }
        }
        for count in 1..=INFLECTION {
            let raw = page / count.max(1);
            let s = (raw / align) * align;
            if s >= align && s <= half {
                set.insert(s);
            }
        }
        if set.is_empty() {
            set.insert(align);
        }
        SizeClasses {
            sizes: set.into_iter().collect(),
        }
    }

    /// Smallest bin whose allocation size is `>= size`, or `None` if `size`
    /// exceeds every small class (caller should route to the large path).
    pub fn bin_for(&self, size: usize) -> Option<usize> {
        let idx = self.sizes.partition_point(|&s| s < size);
        if idx >= self.sizes.len() {
            None
        } else {
            Some(idx)
        }
    }

    pub fn alloc_size(&self, bin: usize) -> usize {
        self.sizes[bin]
    }

    pub fn max_class(&self) -> usize {
        *self.sizes.last().unwrap()
    }

    pub fn bin_count(&self) -> usize {
        self.sizes.len()
    }
}

pub fn size_classes() -> &'static SizeClasses {
    static CLASSES: OnceLock<SizeClasses> = OnceLock::new();
    CLASSES.get_or_init(SizeClasses::build)
}

/// Per-size-class bump state inside a [`ThreadCache`].
#[derive(Clone)]
struct BinState {
    pool: Option<Pool>,
    page_index: usize,
    next_alloc: usize,
    alloc_size: usize,
    alloc_count: u32,
    max_alloc: u32,
}

impl BinState {
    fn empty() -> Self {
        BinState {
            pool: None,
            page_index: 0,
            next_alloc: 0,
            alloc_size: 0,
            alloc_count: 0,
            max_alloc: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.max_alloc == 0 || self.alloc_count >= self.max_alloc
    }
}

/// Per-thread, per-arena allocation cache.
struct ThreadCache {
    bins: RefCell<Vec<BinState>>,
    reserve_next: Cell<usize>,
    reserve_end: Cell<usize>,
    reserve_pool: RefCell<Option<Pool>>,
}

impl ThreadCache {
    fn new() -> Self {
        ThreadCache {
            bins: RefCell::new(vec![BinState::empty(); size_classes().bin_count()]),
            reserve_next: Cell::new(0),
            reserve_end: Cell::new(0),
            reserve_pool: RefCell::new(None),
        }
    }
}

thread_local! {
    static CACHES: RefCell<Vec<Option<std::rc::Rc<ThreadCache>>>> =
        RefCell::new((0..crate::config::MAX_ARENAS).map(|_| None).collect());
}

fn cache_for(arena_id: usize) -> std::rc::Rc<ThreadCache> {
    CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        if caches.len() <= arena_id {
            caches.resize(arena_id + 1, None);
        }
        caches[arena_id]
            .get_or_insert_with(|| std::rc::Rc::new(ThreadCache::new()))
            .clone()
    })
}

/// Rounds `size` up to the allocator's minimum alignment.
pub fn round_to_alignment(size: usize) -> usize {
    let a = MIN_ALIGNMENT;
    (size + a - 1) & !(a - 1)
}

/// Allocates a small object of `size` bytes (already known to be
/// `<= half_page`) from `arena_id`'s thread cache.
pub fn small_alloc(
    alloc: &Allocator,
    arena_id: usize,
    size: usize,
) -> Result<NonNull<u8>, AllocError> {
    let size = round_to_alignment(size.max(1));
    let classes = size_classes();
    let bin = classes.bin_for(size).expect("caller ensures size <= half page");
    let alloc_size = classes.alloc_size(bin);

    #[cfg(feature = "reclaim")]
    if let Some(reused) = crate::subpage::try_reuse(alloc, arena_id, alloc_size) {
        alloc.stats.small_allocs.increase(1);
        return Ok(reused);
    }

    let cache = cache_for(arena_id);
    {
        let mut bins = cache.bins.borrow_mut();
        let state = &mut bins[bin];
        if !state.exhausted() {
            let addr = state.next_alloc;
            let pool = state.pool.clone().unwrap();
            let page_idx = state.page_index;
            mark_slot_allocated(&pool, page_idx, state.alloc_count as usize, alloc_size);
            state.next_alloc += alloc_size;
            state.alloc_count += 1;
            if state.exhausted() {
                mark_page_full(&pool, page_idx);
            }
            alloc.stats.small_allocs.increase(1);
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }
    }

    refill_bin(alloc, arena_id, &cache, bin, alloc_size)?;
    // Retry once after a successful refill.
    let mut bins = cache.bins.borrow_mut();
    let state = &mut bins[bin];
    let addr = state.next_alloc;
    let pool = state.pool.clone().unwrap();
    let page_idx = state.page_index;
    mark_slot_allocated(&pool, page_idx, state.alloc_count as usize, alloc_size);
    state.next_alloc += alloc_size;
    state.alloc_count += 1;
    if state.exhausted() {
        mark_page_full(&pool, page_idx);
    }
    alloc.stats.small_allocs.increase(1);
    Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
}

fn mark_slot_allocated(pool: &Pool, page_index: usize, slot: usize, _alloc_size: usize) {
    if let Tracking::Small { pages } = &pool.tracking {
        let page = pages.get(page_index);
        let was_set = page.bitmap.set(slot);
        if was_set {
            fatal("small allocator handed out an already-allocated slot");
        }
    } else {
        fatal("small_alloc target pool is not a small pool");
    }
}

fn mark_page_full(pool: &Pool, page_index: usize) {
    if let Tracking::Small { pages } = &pool.tracking {
        pages.get(page_index).set_status(crate::pool::PageStatus::FULL);
    }
}

/// Refills an exhausted bin by consuming a page from the thread's blank
/// page reserve, refilling the reserve from the pool's bump pointer if
/// empty, and installing a fresh small pool at the head of the arena's
/// list if the pool itself has no tail left.
fn refill_bin(
    alloc: &Allocator,
    arena_id: usize,
    cache: &ThreadCache,
    bin: usize,
    alloc_size: usize,
) -> Result<(), AllocError> {
    let page_size = config::page_size();
    if cache.reserve_next.get() >= cache.reserve_end.get() {
        refill_reserve(alloc, arena_id, cache)?;
    }
    let page_start = cache.reserve_next.get();
    cache.reserve_next.set(page_start + page_size);
    let pool = cache.reserve_pool.borrow().clone().unwrap();

    let page_index = pool.page_index(page_start);
    if let Tracking::Small { pages } = &pool.tracking {
        let slots = page_size / alloc_size;
        pages.get(page_index).reinit(page_start, alloc_size, slots);
    }

    let mut bins = cache.bins.borrow_mut();
    bins[bin] = BinState {
        pool: Some(pool),
        page_index,
        next_alloc: page_start,
        alloc_size,
        alloc_count: 0,
        max_alloc: (page_size / alloc_size) as u32,
    };
    Ok(())
}

fn refill_reserve(alloc: &Allocator, arena_id: usize, cache: &ThreadCache) -> Result<(), AllocError> {
    let page_size = config::page_size();
    let batch = PAGES_PER_REFILL * page_size;
    let arena = alloc.arenas.get(arena_id).ok_or(AllocError::UnknownArena)?;

    loop {
        let candidate_pool = {
            let pools = arena.small_pools.lock().unwrap();
            pools.first().cloned()
        };
        if let Some(pool) = candidate_pool {
            let want = batch;
            let got = pool.next_free_page.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |cur| {
                    if cur + want <= pool.end {
                        Some(cur + want)
                    } else {
                        None
                    }
                },
            );
            if let Ok(base) = got {
                cache.reserve_next.set(base);
                cache.reserve_end.set(base + want);
                *cache.reserve_pool.borrow_mut() = Some(pool);
                return Ok(());
            }
            // Pool's tail is insufficient: install a fresh pool at the head.
            let mut pools = arena.small_pools.lock().unwrap();
            if pools.first().map(|p| p.start) == Some(pool.start) {
                let fresh = crate::pool::PoolInner::new_small(arena_id, &alloc.metadata, &alloc.stats)?;
                alloc.registry.add(fresh.clone());
                pools.insert(0, fresh);
                trace!("arena {arena_id}: installed fresh small pool");
            }
            continue;
        } else {
            let fresh = crate::pool::PoolInner::new_small(arena_id, &alloc.metadata, &alloc.stats)?;
            alloc.registry.add(fresh.clone());
            arena.small_pools.lock().unwrap().push(fresh);
            continue;
        }
    }
}

/// Frees a small allocation at `addr` within `pool`.
pub fn small_free(alloc: &Allocator, pool: &Pool, addr: usize) {
    let page_size = config::page_size();
    let page_index = pool.page_index(addr);
    let Tracking::Small { pages } = &pool.tracking else {
        fatal("small_free target pool is not a small pool");
    };
    let page = pages.get(page_index);
    let alloc_size = page.alloc_size.load(Ordering::Acquire);
    if alloc_size == 0 {
        fatal("free of pointer into an untouched page");
    }
    let offset = addr - page.start.load(Ordering::Acquire);
    if offset % alloc_size != 0 {
        fatal("free of unaligned pointer within a small page");
    }
    let slot = offset / alloc_size;
    let slots_per_page = page_size / alloc_size;
    let was_set = page.bitmap.clear(slot);
    if !was_set {
        fatal("double free or invalid pointer: slot already free");
    }
    alloc.stats.small_allocs.decrease(1);

    let status = page.status();
    if status.contains(crate::pool::PageStatus::FULL) && page.bitmap.all_zero(slots_per_page) {
        page.set_status(crate::pool::PageStatus::DRAINED);
        crate::release::release_small_page(alloc, pool, page_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_monotonic_and_bounded() {
        let classes = size_classes();
        let mut prev = 0;
        for i in 0..classes.bin_count() {
            let s = classes.alloc_size(i);
            assert!(s > prev);
            assert!(s <= config::half_page());
            prev = s;
        }
    }

    #[test]
    fn bin_for_picks_smallest_fit() {
        let classes = size_classes();
        for i in 0..classes.bin_count() {
            let s = classes.alloc_size(i);
            assert_eq!(classes.bin_for(s), Some(i));
            assert_eq!(classes.bin_for(s - 1).map(|b| classes.alloc_size(b) >= s - 1), Some(true));
        }
    }
}
