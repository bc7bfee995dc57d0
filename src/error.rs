//! Error taxonomy.
//!
//! Out-of-memory and arena-limit conditions are ordinary `Result` errors.
//! Invalid-pointer and corrupted-metadata conditions are *not* represented
//! as `Result`s: these are programming errors in client code and must abort
//! rather than attempt recovery, since silently ignoring a clear bitmap bit
//! would mask the very use-after-free bug class this allocator exists to
//! catch. Those paths call [`fatal`] directly.

use log::error;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("metadata heap exhausted")]
    MetadataExhausted,

    #[error("maximum number of arenas ({max}) already created")]
    TooManyArenas { max: usize },

    #[error("unknown arena key")]
    UnknownArena,

    #[error("size/count overflow computing allocation size")]
    Overflow,

    #[error("alignment must be a power of two at least pointer-sized")]
    InvalidAlignment,
}

/// Logs `msg` at error level and aborts the process.
///
/// This is the single chokepoint for the "invalid pointer" / "corrupted
/// bitmap" fatal paths. Using one helper instead of scattered
/// `panic!`/`abort()` calls keeps the diagnostic format consistent and
/// makes the fatal path easy to audit.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    error!("ffmalloc: fatal: {msg}");
    std::process::abort()
}
