//! Metadata allocator (C1).
//!
//! A bump-plus-freelist allocator within a reserved VA range that backs all
//! allocator-internal structures (page maps, large-pool boundary arrays,
//! radix-tree nodes, `Arc<PoolInner>` control blocks never live here — Rust
//! allocates those via the normal global allocator — but the raw
//! bitmap/boundary arrays do).
//!
//! Metadata allocations are *not* forward-only: internal cycling is fine
//! because metadata is never directly exposed to clients.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{METADATA_BIN_COUNT, METADATA_HEAP_RESERVE, POOL_SIZE};
use crate::error::AllocError;
use crate::os;
use crate::stats::Stats;

const MD_ALIGN: usize = 16;

/// Intrusive free-list node stashed in the first `usize` bytes of a freed
/// metadata block.
struct FreeNode {
    next: *mut FreeNode,
}

/// Bump-plus-freelist metadata heap.
pub struct MetadataHeap {
    /// Base of the reserved (not necessarily committed) VA range.
    base: AtomicUsize,
    /// Next free byte within the committed prefix.
    bump: AtomicUsize,
    /// End of the committed prefix (`base + committed_len`).
    committed_end: AtomicUsize,
    /// End of the reserved range (`base + METADATA_HEAP_RESERVE`).
    reserved_end: AtomicUsize,
    /// 256 size-bucketed free lists (bin `i` holds blocks of size `(i+1)*16`).
    bins: [Mutex<*mut FreeNode>; METADATA_BIN_COUNT],
    /// Two special bins for whole small-pool / whole large-pool tracking
    /// arrays, sized off `POOL_SIZE` rather than the 16-byte bin ladder.
    special_bins: [Mutex<*mut FreeNode>; 2],
    /// Serializes extending the committed prefix.
    commit_lock: Mutex<()>,
}

unsafe impl Send for MetadataHeap {}
unsafe impl Sync for MetadataHeap {}

fn bin_index(size: usize) -> usize {
    let rounded = round_up(size, MD_ALIGN);
    ((rounded / MD_ALIGN).saturating_sub(1)).min(METADATA_BIN_COUNT - 1)
}

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Size class backing a whole small pool's page-map array, and a whole
/// large pool's boundary array, respectively.
pub fn small_pool_tracking_bytes() -> usize {
    let page_size = crate::config::page_size();
    let pages_per_pool = POOL_SIZE / page_size;
    pages_per_pool * std::mem::size_of::<crate::pool::PageMap>()
}

pub fn large_pool_tracking_bytes() -> usize {
    // Worst case: one boundary entry per MIN_ALIGNMENT-sized allocation,
    // capped in practice by large pools holding far fewer, larger
    // allocations; we size generously since this heap is never returned to
    // the OS anyway and cycles via the freelist.
    let max_entries = POOL_SIZE / crate::config::half_page().max(1);
    (max_entries + 1) * std::mem::size_of::<usize>()
}

impl MetadataHeap {
    pub fn new() -> Self {
        MetadataHeap {
            base: AtomicUsize::new(0),
            bump: AtomicUsize::new(0),
            committed_end: AtomicUsize::new(0),
            reserved_end: AtomicUsize::new(0),
            bins: std::array::from_fn(|_| Mutex::new(ptr::null_mut())),
            special_bins: std::array::from_fn(|_| Mutex::new(ptr::null_mut())),
            commit_lock: Mutex::new(()),
        }
    }

    /// Reserves (but does not commit) the whole `METADATA_HEAP_RESERVE`
    /// range up front — reservation alone never backs VA with physical
    /// memory. Commits happen lazily in `POOL_SIZE` chunks as the bump
    /// cursor advances past the committed prefix, so a metadata heap that
    /// ends up nearly empty never pays for memory it never touches.
    fn ensure_reserved(&self, stats: &Stats) -> Result<(), AllocError> {
        if self.base.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        let _g = self.commit_lock.lock().unwrap();
        if self.base.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        let reserve_size = round_up(METADATA_HEAP_RESERVE, POOL_SIZE);
        let p = os::reserve_pool(reserve_size, stats)?;
        let base = p as usize;
        self.base.store(base, Ordering::Release);
        self.bump.store(base, Ordering::Release);
        self.committed_end.store(base, Ordering::Release);
        self.reserved_end.store(base + reserve_size, Ordering::Release);
        Ok(())
    }

    /// Extends the committed prefix by whole `POOL_SIZE` chunks until it
    /// covers `up_to`.
    fn commit_through(&self, up_to: usize, stats: &Stats) -> Result<(), AllocError> {
        loop {
            let end = self.committed_end.load(Ordering::Acquire);
            if end >= up_to {
                return Ok(());
            }
            if end >= self.reserved_end.load(Ordering::Acquire) {
                return Err(AllocError::MetadataExhausted);
            }
            let _g = self.commit_lock.lock().unwrap();
            let end = self.committed_end.load(Ordering::Acquire);
            if end >= up_to {
                return Ok(());
            }
            os::commit_range(end, POOL_SIZE, stats);
            self.committed_end.store(end + POOL_SIZE, Ordering::Release);
        }
    }

    fn bump_alloc(&self, size: usize, stats: &Stats) -> Result<*mut u8, AllocError> {
        self.ensure_reserved(stats)?;
        let size = round_up(size, MD_ALIGN);
        loop {
            let cur = self.bump.load(Ordering::Relaxed);
            let next = cur + size;
            if next > self.reserved_end.load(Ordering::Relaxed) {
                return Err(AllocError::MetadataExhausted);
            }
            self.commit_through(next, stats)?;
            if self
                .bump
                .compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(cur as *mut u8);
            }
        }
    }

    /// Allocates `size` bytes of allocator-internal metadata, rounded up to
    /// 16 bytes.
    pub fn alloc(&self, size: usize, stats: &Stats) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return self.alloc(MD_ALIGN, stats);
        }
        let idx = bin_index(size);
        {
            let mut head = self.bins[idx].lock().unwrap();
            if !head.is_null() {
                let node = *head;
                unsafe {
                    *head = (*node).next;
                }
                return Ok(unsafe { NonNull::new_unchecked(node as *mut u8) });
            }
        }
        let real_size = (idx + 1) * MD_ALIGN;
        let p = self.bump_alloc(real_size, stats)?;
        Ok(unsafe { NonNull::new_unchecked(p) })
    }

    /// Returns a previously-allocated block of `size` bytes to its bin's
    /// free list for reuse by a future metadata allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior call to [`Self::alloc`] (or
    /// [`Self::alloc_special`]) with the same `size`, and must not be used
    /// again afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let idx = bin_index(size);
        let node = ptr.as_ptr() as *mut FreeNode;
        let mut head = self.bins[idx].lock().unwrap();
        (*node).next = *head;
        *head = node;
    }

    /// Allocates a whole small-pool page-map array or whole large-pool
    /// boundary array, using the two dedicated special bins.
    pub fn alloc_special(&self, kind: SpecialKind, stats: &Stats) -> Result<NonNull<u8>, AllocError> {
        let slot = kind as usize;
        {
            let mut head = self.special_bins[slot].lock().unwrap();
            if !head.is_null() {
                let node = *head;
                unsafe {
                    *head = (*node).next;
                }
                return Ok(unsafe { NonNull::new_unchecked(node as *mut u8) });
            }
        }
        let size = match kind {
            SpecialKind::SmallPoolTracking => small_pool_tracking_bytes(),
            SpecialKind::LargePoolTracking => large_pool_tracking_bytes(),
        };
        let p = self.bump_alloc(size, stats)?;
        Ok(unsafe { NonNull::new_unchecked(p) })
    }

    /// # Safety
    /// Same contract as [`Self::free`], using the matching special bin.
    pub unsafe fn free_special(&self, kind: SpecialKind, ptr: NonNull<u8>) {
        let slot = kind as usize;
        let node = ptr.as_ptr() as *mut FreeNode;
        let mut head = self.special_bins[slot].lock().unwrap();
        (*node).next = *head;
        *head = node;
    }
}

#[derive(Clone, Copy, Debug)]
pub enum SpecialKind {
    SmallPoolTracking = 0,
    LargePoolTracking = 1,
}

impl Default for MetadataHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycles_through_freelist() {
        let heap = MetadataHeap::new();
        let stats = Stats::default();
        let a = heap.alloc(32, &stats).unwrap();
        unsafe { heap.free(a, 32) };
        let b = heap.alloc(32, &stats).unwrap();
        // Same bin, LIFO freelist: should get the same block back.
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn bin_index_buckets_by_16_bytes() {
        assert_eq!(bin_index(1), 0);
        assert_eq!(bin_index(16), 0);
        assert_eq!(bin_index(17), 1);
        assert_eq!(bin_index(32), 1);
    }
}
