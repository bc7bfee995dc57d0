//! A one-time-address-use general purpose allocator.
//!
//! Addresses that ever backed a live allocation are never handed out again
//! for different content unless the optional concurrent reclaimer
//! (`reclaim` feature) proves the old content unreachable. See `DESIGN.md`
//! for the module-by-module grounding of this crate's design.

pub mod allocator;
pub mod api;
pub mod arena;
pub mod config;
pub mod error;
pub mod jumbo;
pub mod large;
pub mod metadata;
pub mod os;
pub mod pool;
#[cfg(feature = "reclaim")]
pub mod reclaim;
pub mod registry;
pub mod release;
pub mod small;
pub mod stats;
#[cfg(feature = "reclaim")]
pub mod subpage;

use std::alloc::{GlobalAlloc, Layout};

pub use allocator::Allocator;
pub use error::AllocError;
pub use stats::StatsSnapshot;

/// `GlobalAlloc` front door onto the process-wide [`Allocator`] singleton.
/// Installing this as `#[global_allocator]` gives every `Box`/`Vec`/etc.
/// allocation in the process one-time-address-use semantics.
pub struct Ffmalloc;

unsafe impl GlobalAlloc for Ffmalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match Allocator::global().alloc_aligned(0, layout.size().max(1), layout.align()) {
            Ok(p) => p.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        Allocator::global().free(ptr as usize);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = self.alloc(layout);
        if !p.is_null() {
            std::ptr::write_bytes(p, 0, layout.size());
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(l) => l,
            Err(_) => return std::ptr::null_mut(),
        };
        let new_ptr = self.alloc(new_layout);
        if new_ptr.is_null() {
            return std::ptr::null_mut();
        }
        let copy_len = layout.size().min(new_size);
        std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
        self.dealloc(ptr, layout);
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_alloc_impl_roundtrips() {
        let ffm = Ffmalloc;
        let layout = Layout::from_size_align(48, 16).unwrap();
        unsafe {
            let p = ffm.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            std::ptr::write_bytes(p, 7, 48);
            ffm.dealloc(p, layout);
        }
    }

    #[test]
    fn global_alloc_zeroed_is_zero() {
        let ffm = Ffmalloc;
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let p = ffm.alloc_zeroed(layout);
            assert!(!p.is_null());
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
            ffm.dealloc(p, layout);
        }
    }
}
