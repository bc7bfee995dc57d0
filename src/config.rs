//! Compile-time tuning constants and the small runtime `Options` struct for
//! the three-tier small/large/jumbo design.

use std::env;
use std::sync::OnceLock;

/// Minimum allocator alignment. 16 bytes unless built with `--features align8`.
#[cfg(not(feature = "align8"))]
pub const MIN_ALIGNMENT: usize = 16;
#[cfg(feature = "align8")]
pub const MIN_ALIGNMENT: usize = 8;

/// Pool size: a power of two, at least 1 MiB. Default 2 MiB.
pub const POOL_SIZE_BITS: usize = 21;
pub const POOL_SIZE: usize = 1 << POOL_SIZE_BITS;
pub const POOL_MASK: usize = POOL_SIZE - 1;

/// Number of pages drawn into a thread's blank-page reserve at a time.
#[cfg(not(feature = "single_threaded"))]
pub const PAGES_PER_REFILL: usize = 4;
#[cfg(feature = "single_threaded")]
pub const PAGES_PER_REFILL: usize = POOL_SIZE / 4096;

/// Number of per-CPU large-pool lanes an arena maintains.
#[cfg(not(feature = "single_threaded"))]
pub const MAX_LARGE_LISTS: usize = 16;
#[cfg(feature = "single_threaded")]
pub const MAX_LARGE_LISTS: usize = 1;

/// After this many consecutive lock misses, retire the head of a large-pool list.
pub const MAX_POOLS_PER_LIST: usize = 8;

/// Minimum contiguous freed run (in pages) worth unmapping eagerly.
pub const MIN_PAGES_TO_FREE: usize = 2;

/// Maximum number of arenas (including the default arena at index 0).
pub const MAX_ARENAS: usize = 64;

/// Size of the reserved VA range backing the metadata heap (C1).
pub const METADATA_HEAP_RESERVE: usize = 1 << 30;

/// Number of size-bucketed metadata free-list bins (256 general-purpose,
/// plus two special bins for whole pool-tracking arrays).
pub const METADATA_BIN_COUNT: usize = 256;

/// Small-bin layout. `BIN_COUNT` bins cover sizes up to a half page; the
/// first `INFLECTION` bins are "max-packed" (as many same-sized blocks as
/// possible fit a page), the rest are fixed "stride" multiples of the
/// alignment.
pub const BIN_COUNT: usize = 50;
pub const INFLECTION: usize = 8;

/// Upper bound on `page_size() / MIN_ALIGNMENT` across the page sizes this
/// crate expects to run under (4 KiB-64 KiB), so a page's occupancy bitmap
/// can live inline in its [`crate::pool::PageMap`] rather than as a separate
/// heap-backed array.
pub const MAX_BITMAP_WORDS: usize = 128;

/// Returns the OS page size, queried once and cached.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(not(windows))]
        unsafe {
            let r = libc::sysconf(libc::_SC_PAGESIZE);
            if r > 0 {
                r as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        unsafe {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            let mut si: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut si);
            si.dwPageSize as usize
        }
    })
}

pub fn half_page() -> usize {
    page_size() / 2
}

/// Allocations at or above this size are routed to the jumbo path (C7):
/// `aligned_size >= POOL_SIZE - HALF_PAGE`.
pub fn jumbo_threshold() -> usize {
    POOL_SIZE - half_page()
}

/// Large-pool tail-slack threshold (§4.5): once a pool's remaining room
/// after servicing an allocation would drop below this, the allocator folds
/// the slack into that allocation instead of leaving a stub too small for a
/// future large request to land in.
pub fn large_tail_slack_threshold() -> usize {
    half_page() + MIN_ALIGNMENT
}

/// Runtime-tunable options, read once from the environment on first use.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Enable the concurrent reclaimer (C10). Requires the `reclaim` feature.
    pub reclaim_enabled: bool,
    /// On decommit, remap to `PROT_NONE` instead of unmapping, so the VA
    /// stays reserved but unreadable.
    pub remap_to_protnone: bool,
    /// Minimum contiguous freed run (pages) worth unmapping; overridable for
    /// tests that want to exercise the release engine without allocating
    /// gigabytes.
    pub min_pages_to_free: usize,
    /// Verbose allocator lifecycle logging (pool/arena create/destroy) at
    /// `log::Level::Trace` instead of the default `Debug`.
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            reclaim_enabled: cfg!(feature = "reclaim") && env_flag("FFALLOC_RECLAIM", false),
            remap_to_protnone: env_flag("FFALLOC_PROTNONE_DECOMMIT", false),
            min_pages_to_free: env_usize("FFALLOC_MIN_PAGES_TO_FREE", MIN_PAGES_TO_FREE),
            verbose: env_flag("FFALLOC_VERBOSE", false),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn options() -> &'static Options {
    static OPTIONS: OnceLock<Options> = OnceLock::new();
    OPTIONS.get_or_init(Options::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_power_of_two() {
        assert!(POOL_SIZE.is_power_of_two());
        assert!(POOL_SIZE >= 1 << 20);
    }

    #[test]
    fn jumbo_threshold_below_pool_size() {
        assert!(jumbo_threshold() < POOL_SIZE);
        assert!(jumbo_threshold() > POOL_SIZE / 2);
    }

    #[test]
    fn large_tail_slack_threshold_is_half_page_plus_alignment() {
        assert_eq!(large_tail_slack_threshold(), half_page() + MIN_ALIGNMENT);
        assert!(large_tail_slack_threshold() < page_size());
    }
}
