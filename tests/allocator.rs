//! Whole-allocator integration tests. Each test builds its own
//! [`ffmalloc::Allocator`] via the public API rather than sharing the
//! process-wide singleton, so tests can run independently of each other's
//! arena/pool state.

use std::sync::Arc;
use std::thread;

use ffmalloc::allocator::Allocator;
use ffmalloc::config;

fn new_allocator() -> Allocator {
    Allocator::new_for_test()
}

#[test]
fn alloc_free_alloc_address_differs_without_reclaim() {
    let alloc = new_allocator();
    let a = alloc.alloc(0, 24).unwrap();
    unsafe { alloc.free(a.as_ptr() as usize) };
    let b = alloc.alloc(0, 24).unwrap();
    assert_ne!(a.as_ptr(), b.as_ptr(), "address must not be reused without reclaim proof");
}

#[test]
fn usable_size_reports_the_bin_size_not_the_request() {
    let alloc = new_allocator();
    let p = alloc.alloc(0, 17).unwrap();
    let usable = alloc.usable_size(p.as_ptr() as usize).unwrap();
    assert!(usable >= 17);
    assert_eq!(usable % config::MIN_ALIGNMENT, 0);
}

#[test]
fn jumbo_allocation_is_page_aligned_and_sized_at_least_as_big_as_requested() {
    let alloc = new_allocator();
    let size = config::jumbo_threshold() + 123;
    let p = alloc.alloc(0, size).unwrap();
    assert_eq!(p.as_ptr() as usize % config::page_size(), 0);
    let usable = alloc.usable_size(p.as_ptr() as usize).unwrap();
    assert!(usable >= size);
}

#[test]
fn small_pool_page_drains_and_retires_once_every_slot_is_freed() {
    let alloc = new_allocator();
    let alloc_size = config::MIN_ALIGNMENT * 2;
    let slots = config::page_size() / alloc_size;

    let mut ptrs = Vec::with_capacity(slots);
    for _ in 0..slots {
        ptrs.push(alloc.alloc(0, alloc_size).unwrap());
    }
    // All allocations share one page, now full.
    for p in &ptrs {
        unsafe { alloc.free(p.as_ptr() as usize) };
    }
    // The page (and, since it was the pool's only page here, possibly the
    // pool) is now drained; a subsequent allocation of the same size must
    // not land on any of the freed addresses.
    let fresh = alloc.alloc(0, alloc_size).unwrap();
    assert!(!ptrs.iter().any(|p| p.as_ptr() == fresh.as_ptr()));
}

#[test]
fn large_allocation_neighbours_coalesce_on_free() {
    let alloc = new_allocator();
    let size = config::half_page() + config::MIN_ALIGNMENT;
    let a = alloc.alloc(0, size).unwrap();
    let b = alloc.alloc(0, size).unwrap();
    let c = alloc.alloc(0, size).unwrap();
    unsafe {
        alloc.free(a.as_ptr() as usize);
        alloc.free(b.as_ptr() as usize);
        alloc.free(c.as_ptr() as usize);
    }
    // No crash, no double-free panic: three contiguous large frees must
    // coalesce into one run without tripping the invalid-pointer abort.
}

#[test]
fn large_pool_boundary_array_stays_sorted_and_sizes_are_exact() {
    let alloc = new_allocator();
    let size = config::half_page() + config::MIN_ALIGNMENT;
    let a = alloc.alloc(0, size).unwrap();
    let b = alloc.alloc(0, size).unwrap();
    let c = alloc.alloc(0, size).unwrap();

    // Each allocation's usable size must reflect its own slot, not get
    // confused with a neighbour's by an ambiguous boundary lookup.
    for p in [a, b, c] {
        let usable = alloc.usable_size(p.as_ptr() as usize).unwrap();
        assert!(usable >= size);
        assert!(usable < 2 * size, "usable size must not bleed into a neighbour's slot");
    }
    assert!(a.as_ptr() < b.as_ptr());
    assert!(b.as_ptr() < c.as_ptr());

    // Freeing the middle allocation must not disturb either neighbour.
    unsafe { alloc.free(b.as_ptr() as usize) };
    assert_eq!(alloc.usable_size(a.as_ptr() as usize).unwrap() / size, 1);
    assert_eq!(alloc.usable_size(c.as_ptr() as usize).unwrap() / size, 1);

    unsafe {
        alloc.free(a.as_ptr() as usize);
        alloc.free(c.as_ptr() as usize);
    }
}

#[test]
fn calloc_style_overflow_is_rejected_before_touching_memory() {
    unsafe {
        assert!(ffmalloc::api::ffcalloc(usize::MAX / 2, 4).is_null());
    }
}

#[test]
fn arena_teardown_is_independent_of_the_default_arena() {
    let alloc = new_allocator();
    let id = alloc.create_arena().unwrap();
    let p = alloc.alloc(id, 64).unwrap();
    let _ = p;
    alloc.destroy_arena(id).unwrap();

    // The default arena must remain usable and indestructible.
    let q = alloc.alloc(0, 64).unwrap();
    assert!(!q.as_ptr().is_null());
    assert!(alloc.destroy_arena(0).is_err());
}

#[test]
fn concurrent_mixed_alloc_free_does_not_corrupt_or_crash() {
    // Scaled down from a much larger iteration count to a size that
    // finishes promptly while still exercising cross-thread registry
    // lookups and pool-lock contention.
    let alloc = Arc::new(new_allocator());
    const THREADS: usize = 8;
    const ITERS: usize = 2_000;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || {
                let mut live = Vec::new();
                let mut seed = t as u64 * 7919 + 1;
                for _ in 0..ITERS {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let size = 8 + (seed as usize % (4096 - 8));
                    let p = alloc.alloc(0, size).unwrap();
                    assert!(alloc.registry.find_pool(p.as_ptr() as usize).is_some());
                    live.push(p);
                    if live.len() > 32 {
                        let victim = live.remove((seed as usize) % live.len());
                        unsafe { alloc.free(victim.as_ptr() as usize) };
                    }
                }
                for p in live {
                    unsafe { alloc.free(p.as_ptr() as usize) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("worker thread must not panic");
    }
}
