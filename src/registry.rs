//! Pool registry (C3): maps any client pointer to its owning pool in
//! constant time via a three-level radix tree.
//!
//! Each leaf slot holds two candidate pools — one whose *start* falls in
//! the slot's address prefix, one whose *end* does — because pool base
//! addresses are not required to be pool-size aligned (ASLR-friendly).
//! Lookups are lock-free; only `add`/`remove` take the coarse tree lock.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::POOL_SIZE_BITS;
use crate::pool::{Pool, PoolInner};

const ROOT_BITS: usize = 9;
const STEM_BITS: usize = 9;
const LEAF_BITS: usize = 9;
const ROOT_SIZE: usize = 1 << ROOT_BITS;
const STEM_SIZE: usize = 1 << STEM_BITS;
const LEAF_SIZE: usize = 1 << LEAF_BITS;

/// Bits of virtual address space covered by the radix tree, above
/// `POOL_SIZE_BITS`. 27 bits covers the canonical 48-bit x86-64/AArch64
/// user address space once the low `POOL_SIZE_BITS` are masked off.
const PREFIX_BITS: usize = ROOT_BITS + STEM_BITS + LEAF_BITS;

struct Leaf {
    pool_start: [AtomicPtr<PoolInner>; LEAF_SIZE],
    pool_end: [AtomicPtr<PoolInner>; LEAF_SIZE],
}

impl Leaf {
    fn new() -> Self {
        Leaf {
            pool_start: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            pool_end: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }
}

struct Stem {
    leaves: Vec<AtomicPtr<Leaf>>,
}

impl Stem {
    fn new() -> Self {
        Stem {
            leaves: (0..STEM_SIZE)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
        }
    }
}

struct Root {
    stems: Vec<AtomicPtr<Stem>>,
}

impl Root {
    fn new() -> Self {
        Root {
            stems: (0..ROOT_SIZE)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
        }
    }
}

fn split(addr: usize) -> (usize, usize, usize) {
    let prefix = (addr >> POOL_SIZE_BITS) & ((1usize << PREFIX_BITS) - 1);
    let leaf_idx = prefix & (LEAF_SIZE - 1);
    let stem_idx = (prefix >> LEAF_BITS) & (STEM_SIZE - 1);
    let root_idx = (prefix >> (LEAF_BITS + STEM_BITS)) & (ROOT_SIZE - 1);
    (root_idx, stem_idx, leaf_idx)
}

/// Radix-tree pointer→pool resolver (C3).
pub struct Registry {
    root: Root,
    /// Guards lazy node installation only; `find_pool` never takes this.
    install_lock: RwLock<()>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            root: Root::new(),
            install_lock: RwLock::new(()),
        }
    }

    fn leaf_for(&self, addr: usize, create: bool) -> Option<&Leaf> {
        let (r, s, _) = split(addr);
        let stem_ptr = self.root.stems[r].load(Ordering::Acquire);
        let stem: &Stem = if stem_ptr.is_null() {
            if !create {
                return None;
            }
            let _g = self.install_lock.write().unwrap();
            let existing = self.root.stems[r].load(Ordering::Acquire);
            let stem = if existing.is_null() {
                let boxed = Box::into_raw(Box::new(Stem::new()));
                self.root.stems[r].store(boxed, Ordering::Release);
                boxed
            } else {
                existing
            };
            unsafe { &*stem }
        } else {
            unsafe { &*stem_ptr }
        };

        let leaf_ptr = stem.leaves[s].load(Ordering::Acquire);
        if leaf_ptr.is_null() {
            if !create {
                return None;
            }
            let _g = self.install_lock.write().unwrap();
            let existing = stem.leaves[s].load(Ordering::Acquire);
            let leaf = if existing.is_null() {
                let boxed = Box::into_raw(Box::new(Leaf::new()));
                stem.leaves[s].store(boxed, Ordering::Release);
                boxed
            } else {
                existing
            };
            Some(unsafe { &*leaf })
        } else {
            Some(unsafe { &*leaf_ptr })
        }
    }

    /// Registers `pool` in the tree, keyed by the prefixes of both its
    /// start and (inclusive) last address. Leaks exactly one strong
    /// reference into the tree (via [`Arc::into_raw`]); `remove` reclaims it.
    /// Storing the raw pointer directly (rather than alongside a side table
    /// of owning `Arc`s) is what keeps `find_pool` an O(1) tree walk instead
    /// of a linear scan to upgrade a pointer back into an `Arc`.
    pub fn add(&self, pool: Pool) {
        let start = pool.start;
        let end = pool.end;
        let ptr = Arc::into_raw(pool) as *mut PoolInner;

        let start_leaf = self.leaf_for(start, true).unwrap();
        let (_, _, li) = split(start);
        start_leaf.pool_start[li].store(ptr, Ordering::Release);

        let end_leaf = self.leaf_for(end - 1, true).unwrap();
        let (_, _, le) = split(end - 1);
        end_leaf.pool_end[le].store(ptr, Ordering::Release);
    }

    /// Removes `pool` from the tree and reclaims the strong reference
    /// leaked by `add`. Must be called exactly once per `add`, while `pool`
    /// is still guaranteed alive (i.e. before any other owner's last `Arc`
    /// drops, since this also drops the tree's own reference).
    pub fn remove(&self, pool: &Pool) {
        let ptr = Arc::as_ptr(pool) as *mut PoolInner;
        let (_, _, li) = split(pool.start);
        if let Some(leaf) = self.leaf_for(pool.start, false) {
            leaf.pool_start[li].store(std::ptr::null_mut(), Ordering::Release);
        }
        let (_, _, le) = split(pool.end - 1);
        if let Some(leaf) = self.leaf_for(pool.end - 1, false) {
            leaf.pool_end[le].store(std::ptr::null_mut(), Ordering::Release);
        }
        // Reclaims the strong count `add` leaked via `Arc::into_raw`,
        // balancing it without touching `pool`'s own reference.
        drop(unsafe { Arc::from_raw(ptr) });
    }

    /// Resolves `addr` to its owning pool, if any. Lock-free: the only
    /// locking anywhere in the tree walk is the one-time lazy node install
    /// in `leaf_for`, which `find_pool` never triggers (`create: false`).
    pub fn find_pool(&self, addr: usize) -> Option<Pool> {
        let (r, s, l) = split(addr);
        let stem_ptr = self.root.stems[r].load(Ordering::Acquire);
        if stem_ptr.is_null() {
            return None;
        }
        let stem = unsafe { &*stem_ptr };
        let leaf_ptr = stem.leaves[s].load(Ordering::Acquire);
        if leaf_ptr.is_null() {
            return None;
        }
        let leaf = unsafe { &*leaf_ptr };

        let candidate = leaf.pool_start[l].load(Ordering::Acquire);
        if !candidate.is_null() {
            if let Some(pool) = self.upgrade_if_contains(candidate, addr) {
                return Some(pool);
            }
        }
        let candidate = leaf.pool_end[l].load(Ordering::Acquire);
        if !candidate.is_null() {
            if let Some(pool) = self.upgrade_if_contains(candidate, addr) {
                return Some(pool);
            }
        }
        None
    }

    /// Upgrades a raw pointer stored in the tree back into an owned `Pool`
    /// handle, without consuming the tree's own leaked reference: bumps the
    /// strong count and reconstructs a second `Arc` from the same pointer,
    /// the standard pattern for cloning out of a raw pointer one doesn't own.
    fn upgrade_if_contains(&self, raw: *mut PoolInner, addr: usize) -> Option<Pool> {
        let inner = unsafe { &*raw };
        if !inner.contains(addr) {
            return None;
        }
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataHeap;
    use crate::stats::Stats;

    #[test]
    fn registers_and_resolves_small_pool() {
        let reg = Registry::new();
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let pool = PoolInner::new_small(0, &heap, &stats).unwrap();
        let start = pool.start;
        reg.add(pool.clone());
        let found = reg.find_pool(start).expect("pool resolves");
        assert!(Arc::ptr_eq(&found, &pool));
        assert!(reg.find_pool(pool.end).is_none());
    }

    #[test]
    fn remove_unregisters_pool() {
        let reg = Registry::new();
        let heap = Arc::new(MetadataHeap::new());
        let stats = Stats::default();
        let pool = PoolInner::new_small(0, &heap, &stats).unwrap();
        let start = pool.start;
        reg.add(pool.clone());
        reg.remove(&pool);
        assert!(reg.find_pool(start).is_none());
    }
}
