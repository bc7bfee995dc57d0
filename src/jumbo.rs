//! Jumbo allocator (C7): one allocation, one dedicated pool, released in a
//! single step on free.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::Allocator;
use crate::error::AllocError;
use crate::pool::{Pool, PoolInner};

/// Allocates a jumbo object (`size >= jumbo_threshold()`): a fresh pool
/// sized exactly to the (page-rounded) request, registered under `arena_id`.
pub fn jumbo_alloc(alloc: &Allocator, arena_id: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let arena = alloc.arenas.get(arena_id).ok_or(AllocError::UnknownArena)?;
    let pool = PoolInner::new_jumbo(arena_id, size, &alloc.metadata, &alloc.stats)?;
    alloc.registry.add(pool.clone());
    arena.jumbo_pools.lock().unwrap().push(pool.clone());
    Ok(unsafe { NonNull::new_unchecked(pool.start as *mut u8) })
}

/// Frees a jumbo allocation: the whole pool backing it is unmapped and
/// retired immediately, since by definition it never held more than one
/// live allocation.
pub fn jumbo_free(alloc: &Allocator, pool: &Pool) {
    let arena = match alloc.arenas.get(pool.arena) {
        Some(a) => a,
        None => return,
    };
    let mut pools = arena.jumbo_pools.lock().unwrap();
    if let Some(idx) = pools.iter().position(|p| Arc::ptr_eq(p, pool)) {
        pools.swap_remove(idx);
    }
    drop(pools);
    alloc.registry.remove(pool);
    crate::os::unmap(pool.start as *mut u8, pool.end - pool.start, &alloc.stats);
    alloc.stats.pools.decrease(1);
    alloc.stats.jumbo.decrease(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;

    #[test]
    fn jumbo_alloc_then_free() {
        let alloc = Allocator::new_for_test();
        let size = crate::config::jumbo_threshold() + 4096;
        let ptr = jumbo_alloc(&alloc, 0, size).unwrap();
        let pool = alloc.registry.find_pool(ptr.as_ptr() as usize).unwrap();
        assert!(pool.end - pool.start >= size);
        jumbo_free(&alloc, &pool);
        assert!(alloc.registry.find_pool(ptr.as_ptr() as usize).is_none());
    }
}
