//! Allocator facade (C0): wires together the metadata heap, pool registry,
//! arena table and stats into the single object every entry point in
//! [`crate::api`] and [`crate::Ffmalloc`] operates against.

use std::sync::{Arc, OnceLock};

use log::info;

use crate::arena::ArenaTable;
use crate::config::{self, Options};
use crate::error::AllocError;
use crate::metadata::MetadataHeap;
use crate::registry::Registry;
use crate::stats::{Stats, StatsSnapshot};

pub struct Allocator {
    pub metadata: Arc<MetadataHeap>,
    pub registry: Registry,
    pub arenas: ArenaTable,
    pub stats: Stats,
    pub options: &'static Options,
}

impl Allocator {
    fn new() -> Result<Self, AllocError> {
        let alloc = Allocator {
            metadata: Arc::new(MetadataHeap::new()),
            registry: Registry::new(),
            arenas: ArenaTable::new(),
            stats: Stats::default(),
            options: config::options(),
        };
        alloc.arenas.init_default(&alloc.registry, &alloc.metadata, &alloc.stats)?;
        info!("ffmalloc: default arena provisioned");
        Ok(alloc)
    }

    /// Builds a standalone instance independent of the process-wide
    /// singleton returned by [`Self::global`] — each caller gets its own
    /// arena/pool/metadata bookkeeping (the underlying VA highwater is
    /// still process-global, but nothing else is shared). Primarily useful
    /// for tests that want isolation from other tests' allocator state.
    pub fn new_for_test() -> Self {
        Self::new().expect("allocator construction must succeed")
    }

    /// The process-wide default instance, lazily constructed on first use.
    pub fn global() -> &'static Allocator {
        static INSTANCE: OnceLock<Allocator> = OnceLock::new();
        let instance = INSTANCE.get_or_init(|| {
            Allocator::new().unwrap_or_else(|e| crate::error::fatal(&format!("failed to initialize allocator: {e}")))
        });
        #[cfg(feature = "reclaim")]
        spawn_reclaimer_once(instance);
        instance
    }

    /// Dispatches to the small, large, or jumbo path by size: jumbo above
    /// the jumbo threshold, small at or below a half page, large in between.
    pub fn alloc(&self, arena_id: usize, size: usize) -> Result<std::ptr::NonNull<u8>, AllocError> {
        if size >= config::jumbo_threshold() {
            crate::jumbo::jumbo_alloc(self, arena_id, size)
        } else if size <= config::half_page() {
            crate::small::small_alloc(self, arena_id, size)
        } else {
            crate::large::large_alloc(self, arena_id, size)
        }
    }

    /// Dispatches like [`Self::alloc`], but honors an alignment request
    /// above [`config::MIN_ALIGNMENT`] by routing to a path that guarantees
    /// it structurally rather than computing per-slot padding:
    /// - `align <= page_size()`: the large path, whose bump cursor always
    ///   sits at a page-aligned offset from a page-aligned pool base, so
    ///   every large allocation is already page-aligned.
    /// - `align <= POOL_SIZE`: the jumbo path, whose pools are carved from
    ///   `POOL_SIZE`-aligned mappings.
    /// - otherwise: rejected.
    pub fn alloc_aligned(
        &self,
        arena_id: usize,
        size: usize,
        align: usize,
    ) -> Result<std::ptr::NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }
        if align <= config::MIN_ALIGNMENT {
            return self.alloc(arena_id, size);
        }
        if align <= config::page_size() {
            let bumped = size.max(align);
            return crate::large::large_alloc(self, arena_id, bumped);
        }
        if align <= config::POOL_SIZE {
            let bumped = size.max(align);
            return crate::jumbo::jumbo_alloc(self, arena_id, bumped);
        }
        Err(AllocError::InvalidAlignment)
    }

    /// Frees `addr`, resolving its owning pool through the registry and
    /// dispatching to the matching free path. Aborts via
    /// [`crate::error::fatal`] if `addr` does not belong to any pool
    /// (frees of foreign pointers are a programming error).
    ///
    /// # Safety
    /// `addr` must be an address previously returned by [`Self::alloc`] (or
    /// the public API wrapping it) and not already freed.
    pub unsafe fn free(&self, addr: usize) {
        let pool = match self.registry.find_pool(addr) {
            Some(p) => p,
            None => crate::error::fatal("free of a pointer not owned by this allocator"),
        };
        match pool.kind {
            crate::pool::PoolKind::Small => crate::small::small_free(self, &pool, addr),
            crate::pool::PoolKind::Large => crate::large::large_free(self, &pool, addr),
            crate::pool::PoolKind::Jumbo => crate::jumbo::jumbo_free(self, &pool),
        }
    }

    /// Size of the live allocation at `addr`, if any (backs
    /// `malloc_usable_size`).
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        let pool = self.registry.find_pool(addr)?;
        match &pool.tracking {
            crate::pool::Tracking::Small { pages } => {
                let idx = pool.page_index(addr);
                let page = pages.get(idx);
                let sz = page.alloc_size.load(std::sync::atomic::Ordering::Acquire);
                if sz == 0 {
                    None
                } else {
                    Some(sz)
                }
            }
            crate::pool::Tracking::Large { boundaries, .. } => {
                let count = pool.next_free_index.load(std::sync::atomic::Ordering::Acquire) + 1;
                let slice = &boundaries.as_slice()[..count];
                let idx = slice
                    .binary_search_by_key(&addr, |b| b.addr.load(std::sync::atomic::Ordering::Acquire))
                    .ok()?;
                let next = if idx + 1 < slice.len() {
                    slice[idx + 1].addr.load(std::sync::atomic::Ordering::Acquire)
                } else {
                    pool.next_free_page.load(std::sync::atomic::Ordering::Acquire)
                };
                Some(next - addr)
            }
            crate::pool::Tracking::Jumbo => Some(pool.end - pool.start),
        }
    }

    pub fn create_arena(&self) -> Result<usize, AllocError> {
        self.arenas.create(&self.registry, &self.metadata, &self.stats)
    }

    pub fn destroy_arena(&self, id: usize) -> Result<(), AllocError> {
        self.arenas.destroy(id, &self.registry, &self.stats)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Spawns the reclaimer thread at most once for the process-wide instance.
/// A no-op (beyond the `OnceLock` check) when `Options::reclaim_enabled`
/// is false, which [`crate::reclaim::spawn`] itself checks.
#[cfg(feature = "reclaim")]
fn spawn_reclaimer_once(instance: &'static Allocator) {
    static RECLAIMER: OnceLock<Option<crate::reclaim::ReclaimerHandle>> = OnceLock::new();
    RECLAIMER.get_or_init(|| crate::reclaim::spawn(instance));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_small() {
        let alloc = Allocator::new_for_test();
        let ptr = alloc.alloc(0, 32).unwrap();
        assert_eq!(ptr.as_ptr() as usize % config::MIN_ALIGNMENT, 0);
        unsafe { alloc.free(ptr.as_ptr() as usize) };
    }

    #[test]
    fn repeated_alloc_never_reuses_address_without_release() {
        let alloc = Allocator::new_for_test();
        let a = alloc.alloc(0, 32).unwrap();
        unsafe { alloc.free(a.as_ptr() as usize) };
        let b = alloc.alloc(0, 32).unwrap();
        // A freed-but-not-yet-released slot must not be handed out again.
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn create_and_destroy_arena() {
        let alloc = Allocator::new_for_test();
        let id = alloc.create_arena().unwrap();
        assert!(id != 0);
        let ptr = alloc.alloc(id, 64).unwrap();
        let _ = ptr;
        alloc.destroy_arena(id).unwrap();
        assert!(alloc.destroy_arena(0).is_err());
    }
}
