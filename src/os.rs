//! OS memory adapter (C2).
//!
//! Reserves/commits/decommits page ranges at monotonically advancing
//! addresses ("highwater"), against safe, stable `libc`/`winapi` calls.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::config::POOL_SIZE;
use crate::error::AllocError;
use crate::stats::Stats;

/// Process-wide monotonically advancing cursor across the VA space used for
/// pools. Never decreases.
static POOL_HIGHWATER: AtomicUsize = AtomicUsize::new(0);

/// Pool-sized VA ranges the concurrent reclaimer (C10) has proven
/// unreachable and unmapped, awaiting reissue. This is the only path by
/// which an address is ever handed out twice. Plain addresses, not `Pool`
/// handles: by the time an entry lands here the old `PoolInner` has already
/// been dropped from the registry and every arena list.
static REUSE_QUEUE: std::sync::Mutex<Vec<usize>> = std::sync::Mutex::new(Vec::new());

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Picks an initial highwater value by asking the OS for a hint-only
/// mapping once, then immediately releasing it. This gives us an address
/// that is known-free at the time of the probe, which is as good a
/// starting point as any for a strictly-advancing cursor.
fn probe_initial_highwater() -> usize {
    #[cfg(not(windows))]
    unsafe {
        let probe = libc::mmap(
            ptr::null_mut(),
            POOL_SIZE,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if probe == libc::MAP_FAILED {
            return 0x1_0000_0000; // 4 GiB: arbitrary but plausible fallback
        }
        libc::munmap(probe, POOL_SIZE);
        align_up(probe as usize, POOL_SIZE)
    }
    #[cfg(windows)]
    unsafe {
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
        use winapi::um::winnt::{MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS};
        let probe = VirtualAlloc(ptr::null_mut(), POOL_SIZE, MEM_RESERVE, PAGE_NOACCESS);
        if probe.is_null() {
            return 0x1_0000_0000;
        }
        VirtualFree(probe, 0, MEM_RELEASE);
        align_up(probe as usize, POOL_SIZE)
    }
}

fn highwater() -> &'static AtomicUsize {
    if POOL_HIGHWATER.load(Ordering::Relaxed) == 0 {
        let initial = probe_initial_highwater();
        let _ =
            POOL_HIGHWATER.compare_exchange(0, initial, Ordering::SeqCst, Ordering::SeqCst);
    }
    &POOL_HIGHWATER
}

/// Reserves and commits a fresh, anonymous, private mapping of exactly
/// `size` bytes at a monotonically-advancing address. On an address
/// collision with an existing mapping (e.g. the loader, a prior `mmap`
/// with a hint, or another allocator in-process), advances the highwater
/// by a further `POOL_SIZE` and retries.
pub fn map_pool(size: usize, stats: &Stats) -> Result<*mut u8, AllocError> {
    debug_assert_eq!(size % POOL_SIZE, 0);
    if size == POOL_SIZE {
        while let Some(addr) = pop_reusable_pool() {
            match try_map_fixed(addr, size) {
                MapResult::Ok(p) => {
                    stats.mmap_calls.record(1);
                    stats.reserved.increase(size as i64);
                    stats.committed.increase(size as i64);
                    return Ok(p);
                }
                // Something else (loader, another in-process allocator)
                // has since claimed this address; drop it and try the next
                // queued range rather than falling back to the highwater
                // immediately, since the queue may hold other reusable VA.
                MapResult::Collision => continue,
                MapResult::Oom => return Err(AllocError::OutOfMemory { requested: size }),
            }
        }
    }
    loop {
        let addr = highwater().fetch_add(size, Ordering::SeqCst);
        match try_map_fixed(addr, size) {
            MapResult::Ok(p) => {
                stats.mmap_calls.record(1);
                stats.reserved.increase(size as i64);
                stats.committed.increase(size as i64);
                return Ok(p);
            }
            MapResult::Collision => {
                highwater().fetch_add(POOL_SIZE, Ordering::SeqCst);
                continue;
            }
            MapResult::Oom => return Err(AllocError::OutOfMemory { requested: size }),
        }
    }
}

enum MapResult {
    Ok(*mut u8),
    Collision,
    Oom,
}

/// Reserves (but does not commit) `size` bytes of VA at a monotonically
/// advancing address, for callers — the metadata heap — that commit their
/// own sub-ranges incrementally via [`commit_range`] rather than all at
/// once. Unlike [`map_pool`], never consults the reclaimer's reuse queue:
/// the metadata heap's reservation is made exactly once per process.
pub fn reserve_pool(size: usize, stats: &Stats) -> Result<*mut u8, AllocError> {
    debug_assert_eq!(size % POOL_SIZE, 0);
    loop {
        let addr = highwater().fetch_add(size, Ordering::SeqCst);
        match try_reserve_fixed(addr, size) {
            MapResult::Ok(p) => {
                stats.mmap_calls.record(1);
                stats.reserved.increase(size as i64);
                return Ok(p);
            }
            MapResult::Collision => {
                highwater().fetch_add(POOL_SIZE, Ordering::SeqCst);
                continue;
            }
            MapResult::Oom => return Err(AllocError::OutOfMemory { requested: size }),
        }
    }
}

/// Commits a sub-range of a prior [`reserve_pool`] reservation, making it
/// readable/writable. Called in `POOL_SIZE` increments as the metadata
/// heap's bump cursor crosses its committed prefix.
pub fn commit_range(addr: usize, size: usize, stats: &Stats) {
    #[cfg(not(windows))]
    unsafe {
        if libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            crate::error::fatal(&format!(
                "mprotect(RW) committing metadata heap range failed: {}",
                errno::errno()
            ));
        }
    }
    #[cfg(windows)]
    unsafe {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
        if VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null() {
            crate::error::fatal("VirtualAlloc(MEM_COMMIT) committing metadata heap range failed");
        }
    }
    stats.committed.increase(size as i64);
    stats.commit_calls.record(1);
}

#[cfg(target_os = "linux")]
fn try_reserve_fixed(addr: usize, size: usize) -> MapResult {
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            let e = errno::errno();
            if e.0 == libc::EEXIST {
                MapResult::Collision
            } else {
                warn!("mmap(PROT_NONE) reservation failed at {addr:#x} size {size}: {e}");
                MapResult::Oom
            }
        } else if p as usize != addr {
            libc::munmap(p, size);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn try_reserve_fixed(addr: usize, size: usize) -> MapResult {
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            warn!("mmap(PROT_NONE) reservation failed at {addr:#x} size {size}: {}", errno::errno());
            return MapResult::Oom;
        }
        if p as usize != addr {
            libc::munmap(p, size);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

#[cfg(windows)]
fn try_reserve_fixed(addr: usize, size: usize) -> MapResult {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};
    unsafe {
        let p = VirtualAlloc(addr as *mut _, size, MEM_RESERVE, PAGE_NOACCESS);
        if p.is_null() {
            MapResult::Collision
        } else if p as usize != addr {
            winapi::um::memoryapi::VirtualFree(p, 0, winapi::um::winnt::MEM_RELEASE);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

#[cfg(target_os = "linux")]
fn try_map_fixed(addr: usize, size: usize) -> MapResult {
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            let e = errno::errno();
            if e.0 == libc::EEXIST {
                MapResult::Collision
            } else {
                warn!("mmap failed at {addr:#x} size {size}: {e}");
                MapResult::Oom
            }
        } else if p as usize != addr {
            // Should not happen with MAP_FIXED_NOREPLACE, but guard anyway.
            libc::munmap(p, size);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn try_map_fixed(addr: usize, size: usize) -> MapResult {
    // No MAP_FIXED_NOREPLACE outside Linux: map with a hint and verify we
    // actually landed at the requested address, unmapping and treating a
    // mismatch as a collision otherwise.
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            warn!("mmap failed at {addr:#x} size {size}: {}", errno::errno());
            return MapResult::Oom;
        }
        if p as usize != addr {
            libc::munmap(p, size);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

#[cfg(windows)]
fn try_map_fixed(addr: usize, size: usize) -> MapResult {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    unsafe {
        let p = VirtualAlloc(
            addr as *mut _,
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        if p.is_null() {
            MapResult::Collision
        } else if p as usize != addr {
            winapi::um::memoryapi::VirtualFree(p, 0, winapi::um::winnt::MEM_RELEASE);
            MapResult::Collision
        } else {
            MapResult::Ok(p as *mut u8)
        }
    }
}

fn pop_reusable_pool() -> Option<usize> {
    REUSE_QUEUE.lock().unwrap().pop()
}

/// Unmaps a pool-sized VA range the reclaimer has certified unreachable and
/// enqueues it for a future [`map_pool`] to reissue.
/// This is the only call site that ever makes an address eligible for
/// reuse; ordinary drain-and-release (C8) unmaps without queuing, so those
/// addresses stay dead forever per the base forward-only guarantee.
pub fn reclaim_pool(addr: usize, size: usize, stats: &Stats) {
    unmap(addr as *mut u8, size, stats);
    if size == POOL_SIZE {
        REUSE_QUEUE.lock().unwrap().push(addr);
    }
}

/// Returns `[addr, addr+size)` to the OS outright. Failure caused by VMA
/// pressure is swallowed (a later free will retry via coalescing); any
/// other cause is fatal.
pub fn unmap(addr: *mut u8, size: usize, stats: &Stats) {
    if size == 0 {
        return;
    }
    #[cfg(not(windows))]
    unsafe {
        if libc::munmap(addr as *mut libc::c_void, size) != 0 {
            let e = errno::errno();
            if is_vma_pressure(e.0) {
                warn!("munmap failed (VMA pressure), will retry on a later free: {e}");
                return;
            }
            crate::error::fatal(&format!("munmap({addr:p}, {size}) failed: {e}"));
        }
    }
    #[cfg(windows)]
    unsafe {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        if VirtualFree(addr as *mut _, 0, MEM_RELEASE) == 0 {
            crate::error::fatal(&format!("VirtualFree({addr:p}) failed"));
        }
    }
    stats.committed.decrease(size as i64);
    stats.reserved.decrease(size as i64);
    stats.released.increase(size as i64);
}

/// Remaps `[addr, addr+size)` to `PROT_NONE`, keeping the VA reserved but
/// unreadable — the alternative decommit mode selected by
/// `Options::remap_to_protnone`.
pub fn remap_protnone(addr: *mut u8, size: usize, stats: &Stats) {
    if size == 0 {
        return;
    }
    #[cfg(not(windows))]
    unsafe {
        if libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) != 0 {
            let e = errno::errno();
            if is_vma_pressure(e.0) {
                warn!("mprotect(PROT_NONE) failed (VMA pressure): {e}");
                return;
            }
            crate::error::fatal(&format!(
                "mprotect(PROT_NONE, {addr:p}, {size}) failed: {e}"
            ));
        }
        libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    }
    #[cfg(windows)]
    unsafe {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_DECOMMIT;
        VirtualFree(addr as *mut _, size, MEM_DECOMMIT);
    }
    stats.committed.decrease(size as i64);
    stats.released.increase(size as i64);
}

#[cfg(not(windows))]
fn is_vma_pressure(errno: i32) -> bool {
    errno == libc::ENOMEM
}

/// Releases `[addr, addr+size)` per [`crate::config::Options::remap_to_protnone`]:
/// either unmapped outright or remapped to `PROT_NONE` and decommitted,
/// keeping the VA reserved. Always reports success to the caller — the
/// underlying calls swallow VMA-pressure failures and simply leave the
/// range committed for a later free to retry.
pub fn unmap_or_protnone(addr: usize, size: usize, stats: &Stats) -> bool {
    if crate::config::options().remap_to_protnone {
        remap_protnone(addr as *mut u8, size, stats);
    } else {
        unmap(addr as *mut u8, size, stats);
    }
    true
}

/// Tells the OS the range is unlikely to be reused soon, without changing
/// protection or relinquishing the VA (used to drop physical pages for a
/// pool tail that is not yet eligible for unmap).
pub fn hint_unused(addr: *mut u8, size: usize) {
    if size == 0 {
        return;
    }
    #[cfg(not(windows))]
    unsafe {
        libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    }
}

pub fn os_page_size() -> usize {
    crate::config::page_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let stats = Stats::default();
        let p = map_pool(POOL_SIZE, &stats).expect("map_pool");
        assert!(!p.is_null());
        assert_eq!(p as usize % POOL_SIZE, 0);
        unsafe {
            ptr::write_bytes(p, 0xAB, 16);
        }
        unmap(p, POOL_SIZE, &stats);
    }

    #[test]
    fn highwater_is_monotonic() {
        let stats = Stats::default();
        let a = map_pool(POOL_SIZE, &stats).unwrap();
        let b = map_pool(POOL_SIZE, &stats).unwrap();
        assert!((b as usize) > (a as usize));
        unmap(a, POOL_SIZE, &stats);
        unmap(b, POOL_SIZE, &stats);
    }

    #[test]
    fn reclaimed_pool_is_reissued_before_advancing_highwater() {
        let stats = Stats::default();
        let a = map_pool(POOL_SIZE, &stats).unwrap();
        reclaim_pool(a as usize, POOL_SIZE, &stats);
        // Drain the queue down to (at least) our own entry; other tests in
        // this binary share the process-wide queue, so don't assert which
        // exact address comes back — only that the queue path is taken at
        // all and yields a pool-aligned address.
        let b = map_pool(POOL_SIZE, &stats).unwrap();
        assert_eq!(b as usize % POOL_SIZE, 0);
        unmap(b, POOL_SIZE, &stats);
    }
}
