//! Arenas (C9): groupings of pools with independent lifetime. The default
//! arena (index 0) backs the standard API and can never be destroyed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::MAX_LARGE_LISTS;
use crate::error::AllocError;
use crate::metadata::MetadataHeap;
use crate::pool::{Pool, PoolInner};
use crate::stats::Stats;

/// A named grouping of pools with independent teardown.
pub struct Arena {
    pub id: usize,
    in_use: AtomicBool,
    pub small_pools: Mutex<Vec<Pool>>,
    pub large_pools: Vec<Mutex<Vec<Pool>>>,
    pub jumbo_pools: Mutex<Vec<Pool>>,
}

impl Arena {
    fn empty(id: usize) -> Self {
        Arena {
            id,
            in_use: AtomicBool::new(false),
            small_pools: Mutex::new(Vec::new()),
            large_pools: (0..MAX_LARGE_LISTS).map(|_| Mutex::new(Vec::new())).collect(),
            jumbo_pools: Mutex::new(Vec::new()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Provisions one small pool and `MAX_LARGE_LISTS` large pools.
    fn provision(
        &self,
        registry: &crate::registry::Registry,
        heap: &std::sync::Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<(), AllocError> {
        let small = PoolInner::new_small(self.id, heap, stats)?;
        registry.add(small.clone());
        self.small_pools.lock().unwrap().push(small);

        for lane in &self.large_pools {
            let large = PoolInner::new_large(self.id, heap, stats)?;
            registry.add(large.clone());
            lane.lock().unwrap().push(large);
        }
        self.in_use.store(true, Ordering::Release);
        stats.arenas.increase(1);
        Ok(())
    }

    /// Tears down every pool owned by this arena in one pass. Clients using
    /// allocations from a destroyed arena afterwards invoke undefined
    /// behavior; this is the one documented exception to one-time-use
    /// semantics.
    fn teardown(&self, registry: &crate::registry::Registry, stats: &Stats) {
        for pool in self.small_pools.lock().unwrap().drain(..) {
            registry.remove(&pool);
            crate::os::unmap(pool.start as *mut u8, pool.end - pool.start, stats);
            stats.pools.decrease(1);
        }
        for lane in &self.large_pools {
            for pool in lane.lock().unwrap().drain(..) {
                registry.remove(&pool);
                crate::os::unmap(pool.start as *mut u8, pool.end - pool.start, stats);
                stats.pools.decrease(1);
            }
        }
        for pool in self.jumbo_pools.lock().unwrap().drain(..) {
            registry.remove(&pool);
            crate::os::unmap(pool.start as *mut u8, pool.end - pool.start, stats);
            stats.pools.decrease(1);
            stats.jumbo.decrease(1);
        }
        self.in_use.store(false, Ordering::Release);
        stats.arenas.decrease(1);
    }
}

/// Fixed-size array of arena slots, claimed by CAS.
pub struct ArenaTable {
    slots: Vec<Arena>,
}

impl ArenaTable {
    pub fn new() -> Self {
        ArenaTable {
            slots: (0..crate::config::MAX_ARENAS).map(Arena::empty).collect(),
        }
    }

    pub fn get(&self, id: usize) -> Option<&Arena> {
        self.slots.get(id)
    }

    pub fn default_arena(&self) -> &Arena {
        &self.slots[0]
    }

    /// Claims a free slot and provisions it. Slot 0 (the default arena) is
    /// provisioned eagerly by the allocator constructor, never through
    /// this path.
    pub fn create(
        &self,
        registry: &crate::registry::Registry,
        heap: &std::sync::Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<usize, AllocError> {
        for (idx, arena) in self.slots.iter().enumerate().skip(1) {
            // CAS claims the slot and holds it `true` for the rest of this
            // call; `provision()`'s own `store(true, ..)` is then just a
            // redundant confirmation, not a second claim. Dropping back to
            // `false` in between (as an earlier version of this did) would
            // let a concurrent caller's CAS re-claim the same slot while
            // this one is still provisioning it.
            if arena
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                match arena.provision(registry, heap, stats) {
                    Ok(()) => return Ok(idx),
                    Err(e) => return Err(e),
                }
            }
        }
        Err(AllocError::TooManyArenas {
            max: crate::config::MAX_ARENAS,
        })
    }

    pub fn destroy(
        &self,
        id: usize,
        registry: &crate::registry::Registry,
        stats: &Stats,
    ) -> Result<(), AllocError> {
        if id == 0 {
            return Err(AllocError::UnknownArena);
        }
        let arena = self.slots.get(id).ok_or(AllocError::UnknownArena)?;
        if !arena.is_live() {
            return Err(AllocError::UnknownArena);
        }
        arena.teardown(registry, stats);
        Ok(())
    }

    pub fn init_default(
        &self,
        registry: &crate::registry::Registry,
        heap: &std::sync::Arc<MetadataHeap>,
        stats: &Stats,
    ) -> Result<(), AllocError> {
        self.default_arena().provision(registry, heap, stats)
    }
}

impl Default for ArenaTable {
    fn default() -> Self {
        Self::new()
    }
}
