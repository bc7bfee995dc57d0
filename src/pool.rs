//! Pools (C4): fixed-size VA regions from which allocations are carved,
//! plus their per-pool tracking metadata.
//!
//! A [`PoolInner`] owns its tracking array through `Arc` rather than a raw
//! intrusive pointer: pools carry a back-reference to their arena by index
//! rather than by owning pointer.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::config::{self, POOL_SIZE};
use crate::error::AllocError;
use crate::metadata::{MetadataHeap, SpecialKind};
use crate::os;
use crate::stats::Stats;

/// `next_free_index` sentinel meaning "this is a small pool".
pub const SENTINEL_SMALL: usize = usize::MAX;
/// `next_free_index` sentinel meaning "this is a jumbo pool".
pub const SENTINEL_JUMBO: usize = usize::MAX - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Small,
    Large,
    Jumbo,
}

bitflags! {
    /// Per-page status bits. Modeled as an explicit tagged value rather
    /// than bits packed into `alloc_size`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageStatus: u8 {
        /// All allocations on this page have been freed.
        const DRAINED  = 0b001;
        /// The page's physical memory has been returned to the OS.
        const RELEASED = 0b010;
        /// Every slot on the page has been handed out at least once.
        const FULL     = 0b100;
    }
}

bitflags! {
    /// Per-boundary status bits for a large pool's sorted allocation array.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BoundaryStatus: u8 {
        const FREED     = 0b001;
        const UNMAPPED  = 0b010;
        const RETIRED   = 0b100;
    }
}

/// A raw, manually-managed array living in the metadata heap (C1). Used
/// for page-map arrays and large-pool boundary arrays so that allocator
/// bookkeeping never recurses into the client-facing allocator even when
/// this crate is installed as `#[global_allocator]`.
pub struct MdArray<T> {
    ptr: NonNull<T>,
    len: usize,
}

unsafe impl<T: Send> Send for MdArray<T> {}
unsafe impl<T: Sync> Sync for MdArray<T> {}

impl<T> MdArray<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn get(&self, i: usize) -> &T {
        &self.as_slice()[i]
    }

    /// The raw allocation backing this array, for returning it to the
    /// metadata heap's matching special bin once the pool it belongs to is
    /// retired.
    pub fn raw(&self) -> NonNull<u8> {
        self.ptr.cast()
    }
}

/// Fixed-capacity occupancy bitmap for a small page's slots.
/// Sized to [`config::MAX_BITMAP_WORDS`] so it lives inline in
/// every [`PageMap`] regardless of which bin currently owns the page —
/// pages are recycled across bins over their lifetime (see
/// `small::refill_bin`), so the storage has to cover the smallest alloc
/// size's slot count up front rather than being resized per-bin.
pub struct Bitmap {
    words: [AtomicU64; config::MAX_BITMAP_WORDS],
}

impl Bitmap {
    fn empty() -> Self {
        Bitmap {
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Zeroes every word in `0..slots` worth of bits. Called when a page is
    /// handed to a (possibly new) bin; words outside the active range are
    /// left as-is since they're unreachable until the page is reinitialized
    /// again with a larger slot count.
    fn clear_for(&self, slots: usize) {
        let words = slots.div_ceil(64).max(1);
        for w in &self.words[..words.min(self.words.len())] {
            w.store(0, Ordering::Release);
        }
    }

    /// Sets bit `i`, returning the previous value. Atomic: a freeing thread
    /// may concurrently clear a different bit on the same page.
    pub fn set(&self, i: usize) -> bool {
        let (word, bit) = self.word_for(i);
        let mask = 1u64 << bit;
        (word.fetch_or(mask, Ordering::AcqRel) & mask) != 0
    }

    /// Clears bit `i`, returning whether it had been set.
    pub fn clear(&self, i: usize) -> bool {
        let (word, bit) = self.word_for(i);
        let mask = 1u64 << bit;
        (word.fetch_and(!mask, Ordering::AcqRel) & mask) != 0
    }

    pub fn get(&self, i: usize) -> bool {
        let (word, bit) = self.word_for(i);
        (word.load(Ordering::Acquire) & (1u64 << bit)) != 0
    }

    /// Whether every bit in `0..slots` is clear.
    pub fn all_zero(&self, slots: usize) -> bool {
        let words = slots.div_ceil(64).max(1);
        self.words[..words.min(self.words.len())]
            .iter()
            .all(|w| w.load(Ordering::Acquire) == 0)
    }

    fn word_for(&self, i: usize) -> (&AtomicU64, usize) {
        debug_assert!(i / 64 < self.words.len(), "slot index exceeds page bitmap capacity");
        (&self.words[i / 64], i % 64)
    }
}

/// Per-page metadata for a small pool.
pub struct PageMap {
    pub start: AtomicUsize,
    pub alloc_size: AtomicUsize,
    pub status: AtomicU8,
    pub bitmap: Bitmap,
    #[cfg(feature = "reclaim")]
    pub safemap: Option<Bitmap>,
    #[cfg(feature = "reclaim")]
    pub epoch: AtomicU64,
}

impl PageMap {
    fn empty() -> Self {
        PageMap {
            start: AtomicUsize::new(0),
            alloc_size: AtomicUsize::new(0),
            status: AtomicU8::new(0),
            bitmap: Bitmap::empty(),
            // Always present (not lazily created) so the reclaimer's scan
            // phase (subpage::scan_page) can write into it without racing
            // page (re)initialization.
            #[cfg(feature = "reclaim")]
            safemap: Some(Bitmap::empty()),
            #[cfg(feature = "reclaim")]
            epoch: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> PageStatus {
        PageStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, bits: PageStatus) {
        self.status.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Re-purposes this page-map slot for a fresh page, possibly backing a
    /// different bin (and so a different slot count) than it did last time.
    pub fn reinit(&self, page_start: usize, alloc_size: usize, slots: usize) {
        self.start.store(page_start, Ordering::Release);
        self.alloc_size.store(alloc_size, Ordering::Release);
        self.status.store(0, Ordering::Release);
        self.bitmap.clear_for(slots);
        #[cfg(feature = "reclaim")]
        {
            if let Some(safemap) = &self.safemap {
                safemap.clear_for(slots);
            }
            self.epoch.store(0, Ordering::Release);
        }
    }
}

/// One entry in a large pool's sorted boundary array. `addr` is the start
/// address of the allocation beginning at this slot; the allocation's size is
/// `arr[i+1].addr - arr[i].addr`.
pub struct LargeBoundary {
    pub addr: AtomicUsize,
    pub status: AtomicU8,
}

impl LargeBoundary {
    pub fn status(&self) -> BoundaryStatus {
        BoundaryStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }
}

/// Tracking metadata specific to each pool kind.
pub enum Tracking {
    Small { pages: MdArray<PageMap> },
    Large {
        boundaries: MdArray<LargeBoundary>,
        kind: SpecialKind,
    },
    Jumbo,
}

/// A fixed-size VA region carved into slots.
pub struct PoolInner {
    pub start: usize,
    pub end: usize,
    pub next_free_page: AtomicUsize,
    pub start_in_use: AtomicUsize,
    pub end_in_use: AtomicUsize,
    pub tracking: Tracking,
    pub next_free_index: AtomicUsize,
    pub arena: usize,
    pub lock: Mutex<()>,
    pub kind: PoolKind,
    /// Kept so [`Drop`] can return this pool's tracking array to the
    /// metadata heap's matching free list. A back-reference to the heap
    /// rather than to "the" global instance, since tests construct their
    /// own independent [`MetadataHeap`]s (metadata cycling is internal and
    /// never forward-only).
    heap: Arc<MetadataHeap>,
}

pub type Pool = Arc<PoolInner>;

impl Drop for PoolInner {
    /// Returns this pool's tracking array to its metadata-heap bin. Safe
    /// specifically because this only runs once the last `Arc<PoolInner>`
    /// has gone away — unlike the VA itself (reclaimed only by C10 through
    /// the explicit reuse queue), metadata is allowed to cycle freely, and
    /// `Drop` guarantees nothing else still holds a reference into it.
    fn drop(&mut self) {
        if let Some((kind, ptr)) = self.metadata_handle() {
            unsafe { self.heap.free_special(kind, ptr) };
        }
    }
}

impl PoolInner {
    /// Creates a small pool: `POOL_SIZE` of VA, one [`PageMap`] per page.
    pub fn new_small(
        arena: usize,
        heap: &Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<Pool, AllocError> {
        let base = os::map_pool(POOL_SIZE, stats)?;
        let page_size = config::page_size();
        let n_pages = POOL_SIZE / page_size;
        let raw = heap.alloc_special(SpecialKind::SmallPoolTracking, stats)?;
        let ptr = raw.as_ptr() as *mut PageMap;
        for i in 0..n_pages {
            unsafe { ptr::write(ptr.add(i), PageMap::empty()) };
        }
        let pages = MdArray {
            ptr: NonNull::new(ptr).unwrap(),
            len: n_pages,
        };
        stats.pools.increase(1);
        stats.pages.increase(n_pages as i64);
        Ok(Arc::new(PoolInner {
            start: base as usize,
            end: base as usize + POOL_SIZE,
            next_free_page: AtomicUsize::new(base as usize),
            start_in_use: AtomicUsize::new(base as usize),
            end_in_use: AtomicUsize::new(base as usize + POOL_SIZE),
            tracking: Tracking::Small { pages },
            next_free_index: AtomicUsize::new(SENTINEL_SMALL),
            arena,
            lock: Mutex::new(()),
            kind: PoolKind::Small,
            heap: heap.clone(),
        }))
    }

    /// Creates a large pool: `POOL_SIZE` of VA, a sorted boundary array.
    pub fn new_large(
        arena: usize,
        heap: &Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<Pool, AllocError> {
        let base = os::map_pool(POOL_SIZE, stats)?;
        let raw = heap.alloc_special(SpecialKind::LargePoolTracking, stats)?;
        let max_entries =
            crate::metadata::large_pool_tracking_bytes() / std::mem::size_of::<LargeBoundary>();
        let ptr = raw.as_ptr() as *mut LargeBoundary;
        for i in 0..max_entries {
            unsafe {
                ptr::write(
                    ptr.add(i),
                    LargeBoundary {
                        addr: AtomicUsize::new(0),
                        status: AtomicU8::new(0),
                    },
                )
            };
        }
        let boundaries = MdArray {
            ptr: NonNull::new(ptr).unwrap(),
            len: max_entries,
        };
        // Slot 0 starts as the trailing sentinel for an empty pool.
        boundaries.get(0).addr.store(base as usize, Ordering::Release);
        stats.pools.increase(1);
        Ok(Arc::new(PoolInner {
            start: base as usize,
            end: base as usize + POOL_SIZE,
            next_free_page: AtomicUsize::new(base as usize),
            start_in_use: AtomicUsize::new(base as usize),
            end_in_use: AtomicUsize::new(base as usize + POOL_SIZE),
            tracking: Tracking::Large {
                boundaries,
                kind: SpecialKind::LargePoolTracking,
            },
            next_free_index: AtomicUsize::new(0),
            arena,
            lock: Mutex::new(()),
            kind: PoolKind::Large,
            heap: heap.clone(),
        }))
    }

    /// Creates a jumbo pool: one allocation, one pool, sized to fit it.
    /// Jumbo pools carry no separate tracking array (`metadata_handle`
    /// returns `None` for them), but still keep a `heap` handle for
    /// uniformity with the other two constructors.
    pub fn new_jumbo(
        arena: usize,
        size: usize,
        heap: &Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<Pool, AllocError> {
        let page_size = config::page_size();
        let rounded = round_up(size, page_size);
        let rounded = round_up(rounded, POOL_SIZE.min(page_size).max(page_size));
        let base = os::map_pool(round_up(rounded, POOL_SIZE), stats)?;
        stats.pools.increase(1);
        stats.jumbo.increase(1);
        Ok(Arc::new(PoolInner {
            start: base as usize,
            end: base as usize + rounded,
            next_free_page: AtomicUsize::new(base as usize + rounded),
            start_in_use: AtomicUsize::new(base as usize),
            end_in_use: AtomicUsize::new(base as usize + rounded),
            tracking: Tracking::Jumbo,
            next_free_index: AtomicUsize::new(SENTINEL_JUMBO),
            arena,
            lock: Mutex::new(()),
            kind: PoolKind::Jumbo,
            heap: heap.clone(),
        }))
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Release monotonicity: a pool is destroyed iff
    /// `start_in_use >= end_in_use`.
    pub fn is_drained(&self) -> bool {
        self.start_in_use.load(Ordering::Acquire) >= self.end_in_use.load(Ordering::Acquire)
    }

    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) / config::page_size()
    }

    /// The metadata-heap special bin and raw allocation backing this
    /// pool's tracking array, if it has one (jumbo pools carry no separate
    /// tracking array). Used when a pool is retired — by drain-triggered
    /// release (C8) or by the reclaimer (C10) — to return the array to
    /// [`crate::metadata::MetadataHeap`] for reuse by a future pool of the
    /// same kind — metadata allocations are not forward-only, unlike
    /// client-facing addresses.
    pub fn metadata_handle(&self) -> Option<(SpecialKind, NonNull<u8>)> {
        match &self.tracking {
            Tracking::Small { pages } => Some((SpecialKind::SmallPoolTracking, pages.raw())),
            Tracking::Large { boundaries, kind } => Some((*kind, boundaries.raw())),
            Tracking::Jumbo => None,
        }
    }
}

fn round_up(x: usize, align: usize) -> usize {
    if align == 0 {
        return x;
    }
    (x + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_pool_pages_start_empty() {
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let pool = PoolInner::new_small(0, &heap, &stats).unwrap();
        if let Tracking::Small { pages } = &pool.tracking {
            assert_eq!(pages.len(), POOL_SIZE / config::page_size());
            assert!(pages.get(0).bitmap.all_zero(64));
        } else {
            panic!("expected small tracking");
        }
    }

    #[test]
    fn large_pool_starts_with_sentinel_boundary() {
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let pool = PoolInner::new_large(0, &heap, &stats).unwrap();
        if let Tracking::Large { boundaries, .. } = &pool.tracking {
            assert_eq!(
                boundaries.get(0).addr.load(Ordering::Relaxed),
                pool.start
            );
        } else {
            panic!("expected large tracking");
        }
    }

    #[test]
    fn jumbo_pool_is_sized_to_request() {
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let pool = PoolInner::new_jumbo(0, 3 * 1024 * 1024, &heap, &stats).unwrap();
        assert!(pool.end - pool.start >= 3 * 1024 * 1024);
        assert_eq!(
            pool.next_free_index.load(Ordering::Relaxed),
            SENTINEL_JUMBO
        );
    }

    #[test]
    fn dropping_last_pool_handle_recycles_its_tracking_array() {
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let first = PoolInner::new_small(0, &heap, &stats).unwrap();
        let raw = first.metadata_handle().unwrap().1;
        drop(first);
        let second = PoolInner::new_small(0, &heap, &stats).unwrap();
        // Same bin (small-pool tracking is the only thing in that special
        // bin at this point), LIFO freelist: the array is recycled.
        assert_eq!(second.metadata_handle().unwrap().1, raw);
    }
}
