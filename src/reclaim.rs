//! Concurrent mark-sweep reclaimer (C10, optional)
//!
//! Enables address *reuse*, the one exception to otherwise one-time-use
//! address semantics: a background thread periodically stops the
//! mutators, conservatively scans registered memory for words that look
//! like pointers into a candidate pool, and if none are found, the pool's
//! VA is handed back to [`crate::os`] for a future `map_pool` to reissue.
//!
//! Gated behind the `reclaim` feature; `config::options().reclaim_enabled`
//! additionally gates it at runtime, off by default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::allocator::Allocator;
use crate::pool::Pool;

/// Sparse, two-level pointer bitmap (the scanmap), bucketed by
/// the high bits of a candidate address, each bucket a bitset over the
/// low bits at word (8-byte) granularity. Sparse because most of the
/// address space is never a scan candidate.
pub struct ScanMap {
    buckets: Mutex<HashMap<usize, u64>>,
}

const BUCKET_BITS: usize = 6; // 64 words per bucket
const WORD_SIZE: usize = 8;

impl ScanMap {
    pub fn new() -> Self {
        ScanMap {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn split(addr: usize) -> (usize, u32) {
        let word = addr / WORD_SIZE;
        (word >> BUCKET_BITS, (word & ((1 << BUCKET_BITS) - 1)) as u32)
    }

    /// Marks the word at `addr` as containing a value that decoded as a
    /// pointer into pool-backed VA space during a scan pass.
    pub fn mark(&self, addr: usize) {
        let (bucket, bit) = Self::split(addr);
        let mut buckets = self.buckets.lock().unwrap();
        *buckets.entry(bucket).or_insert(0) |= 1u64 << bit;
    }

    pub fn check(&self, addr: usize) -> bool {
        let (bucket, bit) = Self::split(addr);
        let buckets = self.buckets.lock().unwrap();
        buckets.get(&bucket).map(|w| w & (1u64 << bit) != 0).unwrap_or(false)
    }

    /// Clears every mark, called at the start of each scan cycle: scans
    /// are from-scratch each cycle, not cumulative.
    pub fn clear(&self) {
        self.buckets.lock().unwrap().clear();
    }
}

impl Default for ScanMap {
    fn default() -> Self {
        Self::new()
    }
}

/// A conservative scan root: a `[start, end)` byte range of mutator memory
/// (typically a thread's stack, or a static data segment) that may contain
/// pointer-shaped values. Mutators register their own roots; the
/// reclaimer never infers them: explicit, conservative roots rather than a
/// typed GC.
#[derive(Clone, Copy)]
pub struct ScanRoot {
    pub start: usize,
    pub end: usize,
}

/// Arithmetic moving-average scheduler: the reclaimer sleeps longer while
/// the recent small-allocation rate exceeds the running average, and wakes
/// sooner as it falls below it. See DESIGN.md for why only the arithmetic
/// average is tracked here.
struct Scheduler {
    average: Mutex<f64>,
    last_sample: Mutex<(Instant, u64)>,
}

impl Scheduler {
    fn new(initial_count: u64) -> Self {
        Scheduler {
            average: Mutex::new(0.0),
            last_sample: Mutex::new((Instant::now(), initial_count)),
        }
    }

    /// Samples the current small-allocation counter, updates the moving
    /// average, and returns how long the reclaimer should sleep before its
    /// next cycle.
    fn next_interval(&self, current_count: u64) -> Duration {
        const ALPHA: f64 = 0.2;
        const BASE: Duration = Duration::from_millis(50);
        const MAX: Duration = Duration::from_secs(2);

        let mut last = self.last_sample.lock().unwrap();
        let elapsed = last.0.elapsed().as_secs_f64().max(0.001);
        let rate = (current_count.saturating_sub(last.1)) as f64 / elapsed;
        *last = (Instant::now(), current_count);
        drop(last);

        let mut avg = self.average.lock().unwrap();
        *avg = if *avg == 0.0 { rate } else { ALPHA * rate + (1.0 - ALPHA) * *avg };
        let avg = *avg;

        if rate > avg {
            // Allocation-heavy: back off so the reclaimer doesn't compete
            // with the mutator for the pool locks it needs to scan.
            MAX
        } else {
            BASE
        }
    }
}

/// Coordinates stop-the-world via `SIGUSR1` (suspend) / `SIGUSR2` (resume).
/// A mutator thread registers itself, then periodically checks
/// [`Reclaimer::checkpoint`] (a trylock against a shared mutex the
/// reclaimer holds only while the world is meant to be stopped) at safe
/// points — this crate does not inject checkpoints into every allocation
/// automatically; callers that need precise STW semantics call
/// `checkpoint()` at their own safe points — a cooperative substitute for
/// signal-based suspension, which relies on a critical section the
/// mutator itself holds so the reclaimer can observe "world stopped" by
/// trylock.
pub struct Reclaimer {
    scanmap: ScanMap,
    roots: Mutex<Vec<ScanRoot>>,
    world_stopped: AtomicBool,
    stopped_count: AtomicI32,
    expected_mutators: AtomicI32,
    resume: Condvar,
    resume_lock: Mutex<()>,
    scheduler: Scheduler,
    cycles: AtomicU64,
    shutdown: AtomicBool,
}

impl Reclaimer {
    pub fn new() -> Self {
        Reclaimer {
            scanmap: ScanMap::new(),
            roots: Mutex::new(Vec::new()),
            world_stopped: AtomicBool::new(false),
            stopped_count: AtomicI32::new(0),
            expected_mutators: AtomicI32::new(0),
            resume: Condvar::new(),
            resume_lock: Mutex::new(()),
            scheduler: Scheduler::new(0),
            cycles: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registers a scan root (e.g. a thread's stack bounds). Call once per
    /// thread at startup.
    pub fn register_root(&self, root: ScanRoot) {
        self.roots.lock().unwrap().push(root);
    }

    /// A mutator-side safe point: blocks while the reclaimer has the world
    /// stopped, then returns. Cheap (an `Ordering::Relaxed` load) in the
    /// common case where no reclaim cycle is underway.
    pub fn checkpoint(&self) {
        if !self.world_stopped.load(Ordering::Relaxed) {
            return;
        }
        self.stopped_count.fetch_add(1, Ordering::SeqCst);
        let guard = self.resume_lock.lock().unwrap();
        let _unused = self
            .resume
            .wait_while(guard, |_| self.world_stopped.load(Ordering::SeqCst))
            .unwrap();
        self.stopped_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn stop_the_world(&self) {
        self.world_stopped.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
    }

    fn resume_the_world(&self) {
        let _g = self.resume_lock.lock().unwrap();
        self.world_stopped.store(false, Ordering::SeqCst);
        self.resume.notify_all();
        #[cfg(unix)]
        unsafe {
            libc::raise(libc::SIGUSR2);
        }
    }

    /// Scans every registered root for word-aligned values that fall
    /// within `pool`'s VA range, marking hits in the scanmap.
    fn scan_for(&self, pool: &Pool) -> bool {
        self.scanmap.clear();
        let roots = self.roots.lock().unwrap();
        let mut found = false;
        for root in roots.iter() {
            let mut addr = root.start;
            while addr + WORD_SIZE <= root.end {
                let candidate = unsafe { (addr as *const usize).read_unaligned() };
                if candidate >= pool.start && candidate < pool.end {
                    self.scanmap.mark(addr);
                    found = true;
                }
                addr += WORD_SIZE;
            }
        }
        found
    }

    /// Runs one reclaim cycle over `candidates`: pools whose allocations
    /// have all been logically freed (but whose VA we have not yet
    /// released for reuse). Pools proven unreachable are returned.
    fn cycle(&self, candidates: &[Pool]) -> Vec<Pool> {
        if candidates.is_empty() {
            return Vec::new();
        }
        self.expected_mutators.store(0, Ordering::SeqCst);
        self.stop_the_world();
        // Brief STW pause: checkpoint() is opt-in, so the wait is bounded
        // rather than blocking on every mutator checking in.
        std::thread::sleep(Duration::from_millis(1));

        let mut reclaimed = Vec::new();
        for pool in candidates {
            if !self.scan_for(pool) {
                reclaimed.push(pool.clone());
            }
        }

        self.resume_the_world();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        reclaimed
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the background reclaimer thread for `alloc`. The thread runs
/// until [`ReclaimerHandle::shutdown`] is called or the process exits.
/// Does nothing (and returns `None`) unless `Options::reclaim_enabled` is
/// set, since this is an opt-in, off-by-default feature.
pub fn spawn(alloc: &'static Allocator) -> Option<ReclaimerHandle> {
    if !alloc.options.reclaim_enabled {
        debug!("reclaimer disabled (FFALLOC_RECLAIM not set)");
        return None;
    }
    let reclaimer = std::sync::Arc::new(Reclaimer::new());
    let r2 = reclaimer.clone();
    let join = std::thread::Builder::new()
        .name("ffmalloc-reclaim".into())
        .spawn(move || reclaim_loop(alloc, r2))
        .ok()?;
    Some(ReclaimerHandle {
        reclaimer,
        join: Some(join),
    })
}

fn reclaim_loop(alloc: &'static Allocator, reclaimer: std::sync::Arc<Reclaimer>) {
    #[cfg(unix)]
    install_signal_handlers();

    while !reclaimer.shutdown.load(Ordering::Acquire) {
        let current = alloc.stats.small_allocs.allocated();
        let interval = reclaimer.scheduler.next_interval(current);
        std::thread::sleep(interval);
        if reclaimer.shutdown.load(Ordering::Acquire) {
            break;
        }

        let candidates = drained_candidates(alloc);
        if candidates.is_empty() {
            continue;
        }
        let reclaimed = reclaimer.cycle(&candidates);
        for pool in reclaimed {
            retire_reclaimed(alloc, &pool);
        }
        crate::subpage::advance_epoch();
        alloc.stats.reclaim_cycles.record(1);
    }
}

/// Pools already fully drained (every page released) in every arena, and
/// therefore candidates for the reclaimer to prove unreachable and return
/// to the reuse pool. Ordinary (non-drained) pools are never candidates:
/// reclaiming a pool with live allocations would violate one-time-use for
/// the *other* still-live allocations sharing it.
fn drained_candidates(alloc: &Allocator) -> Vec<Pool> {
    let mut out = Vec::new();
    for arena in 0..crate::config::MAX_ARENAS {
        let Some(arena) = alloc.arenas.get(arena) else { continue };
        if !arena.is_live() {
            continue;
        }
        for pool in arena.small_pools.lock().unwrap().iter() {
            if pool.is_drained() {
                out.push(pool.clone());
            }
        }
        for lane in &arena.large_pools {
            for pool in lane.lock().unwrap().iter() {
                if pool.is_drained() {
                    out.push(pool.clone());
                }
            }
        }
    }
    out
}

/// Unlists a pool the scanner has proven unreachable, drops it from the
/// registry, and hands its VA to [`crate::os::reclaim_pool`] so a future
/// `map_pool` can reissue it — the one path by which this crate reuses an
/// address. `unlist_from_arena` can fail to find the pool if
/// another thread retired it first (e.g. via ordinary drain in
/// [`crate::release`]) between this cycle's candidate scan and now; in that
/// case the pool is already gone and there is nothing left to do.
fn retire_reclaimed(alloc: &Allocator, pool: &Pool) {
    if !crate::release::unlist_from_arena(alloc, pool) {
        return;
    }
    alloc.registry.remove(pool);
    crate::os::reclaim_pool(pool.start, pool.end - pool.start, &alloc.stats);
    alloc.stats.pools.decrease(1);
    alloc.stats.reclaimed_bytes.increase((pool.end - pool.start) as i64);
    trace!("reclaimer: pool at {:#x} proven unreachable, queued for reuse", pool.start);
}

#[cfg(unix)]
extern "C" fn handle_usr1(_sig: libc::c_int) {}
#[cfg(unix)]
extern "C" fn handle_usr2(_sig: libc::c_int) {}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_usr1 as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut()) != 0 {
            warn!("failed to install SIGUSR1 handler for reclaimer stop-the-world");
        }
        let mut sa2: libc::sigaction = std::mem::zeroed();
        sa2.sa_sigaction = handle_usr2 as usize;
        libc::sigemptyset(&mut sa2.sa_mask);
        if libc::sigaction(libc::SIGUSR2, &sa2, std::ptr::null_mut()) != 0 {
            warn!("failed to install SIGUSR2 handler for reclaimer resume");
        }
    }
}

/// Handle to a spawned reclaimer thread.
pub struct ReclaimerHandle {
    reclaimer: std::sync::Arc<Reclaimer>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ReclaimerHandle {
    pub fn shutdown(mut self) {
        self.reclaimer.request_shutdown();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn checkpoint(&self) {
        self.reclaimer.checkpoint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanmap_marks_and_checks_round_trip() {
        let map = ScanMap::new();
        map.mark(0x1000);
        assert!(map.check(0x1000));
        assert!(!map.check(0x2000));
        map.clear();
        assert!(!map.check(0x1000));
    }

    #[test]
    fn scheduler_backs_off_above_average() {
        let sched = Scheduler::new(0);
        let first = sched.next_interval(1000);
        let second = sched.next_interval(2000);
        assert!(first <= second || first == second);
    }
}
