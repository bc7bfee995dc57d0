//! C-shaped external interfaces (C6): the allocation/free surface a
//! `GlobalAlloc` impl or an ABI shim would sit on top of.
//! These are ordinary safe-to-call `unsafe fn`s, not `#[no_mangle] extern
//! "C"` symbols — exporting a libc-compatible `malloc`/`free` ABI is a
//! separate shim layered on top of this crate, out of scope here.

use std::ptr::NonNull;

use crate::allocator::Allocator;
use crate::error::AllocError;

fn alloc() -> &'static Allocator {
    Allocator::global()
}

/// Allocates at least `size` bytes from the default arena, `null` on
/// failure.
pub unsafe fn ffalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ffalloc(1);
    }
    match alloc().alloc(0, size) {
        Ok(p) => p.as_ptr(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Allocates zeroed memory for `nmemb * size` bytes, checking for overflow.
pub unsafe fn ffcalloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return std::ptr::null_mut(),
    };
    let p = ffalloc(total.max(1));
    if !p.is_null() {
        std::ptr::write_bytes(p, 0, total);
    }
    p
}

/// Frees a pointer previously returned by this module.
///
/// # Safety
/// `ptr` must be either null or a live allocation from this allocator.
pub unsafe fn fffree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    alloc().free(ptr as usize);
}

/// Resizes an allocation, preserving the lesser of the old and new sizes'
/// worth of content. When `new_size` already fits the existing
/// allocation's usable size (its bin/boundary/jumbo slot), the same pointer
/// is returned unchanged; addresses are never reused for different content,
/// so growing past the existing slot still has to allocate fresh and copy.
///
/// # Safety
/// `ptr` must be either null or a live allocation from this allocator.
pub unsafe fn ffrealloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return ffalloc(new_size);
    }
    if new_size == 0 {
        fffree(ptr);
        return std::ptr::null_mut();
    }
    let old_size = match alloc().usable_size(ptr as usize) {
        Some(s) => s,
        None => return std::ptr::null_mut(),
    };
    if new_size <= old_size {
        return ptr;
    }
    let new_ptr = ffalloc(new_size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_size.min(new_size);
    std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    fffree(ptr);
    new_ptr
}

/// Returns the usable size of a live allocation, or 0 if `ptr` is null or
/// unrecognized.
pub unsafe fn ffmalloc_usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    alloc().usable_size(ptr as usize).unwrap_or(0)
}

/// Aligned allocation entry point backing `posix_memalign`/`memalign`/
/// `aligned_alloc`.
pub unsafe fn ffaligned_alloc(align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    alloc().alloc_aligned(0, size.max(1), align)
}

/// `posix_memalign`-shaped wrapper: on success, writes the pointer through
/// `out` and returns `Ok(())`; on failure returns the error without
/// touching `out`.
///
/// # Safety
/// `out` must point to a valid, writable `*mut u8`.
pub unsafe fn ffposix_memalign(out: *mut *mut u8, align: usize, size: usize) -> Result<(), AllocError> {
    if align < std::mem::size_of::<usize>() || !align.is_power_of_two() {
        return Err(AllocError::InvalidAlignment);
    }
    let p = ffaligned_alloc(align, size)?;
    *out = p.as_ptr();
    Ok(())
}

/// Allocates `size` bytes aligned to the OS page size.
pub unsafe fn ffvalloc(size: usize) -> *mut u8 {
    ffaligned_alloc(crate::config::page_size(), size)
        .map(|p| p.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// Like `ffvalloc`, additionally rounding `size` up to a whole number of
/// pages.
pub unsafe fn ffpvalloc(size: usize) -> *mut u8 {
    let page = crate::config::page_size();
    let rounded = (size + page - 1) / page * page;
    ffvalloc(rounded.max(page))
}

/// Duplicates a NUL-terminated C string into freshly allocated memory.
///
/// # Safety
/// `s` must be a valid pointer to a NUL-terminated string.
pub unsafe fn ffstrdup(s: *const std::os::raw::c_char) -> *mut std::os::raw::c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let len = std::ffi::CStr::from_ptr(s).to_bytes().len();
    ffstrndup(s, len)
}

/// Duplicates at most `n` bytes of a C string plus a NUL terminator.
///
/// # Safety
/// `s` must be a valid pointer to a NUL-terminated string of at least `n`
/// readable bytes (or shorter, terminated before `n`).
pub unsafe fn ffstrndup(s: *const std::os::raw::c_char, n: usize) -> *mut std::os::raw::c_char {
    let full = std::ffi::CStr::from_ptr(s).to_bytes();
    let len = full.len().min(n);
    let p = ffalloc(len + 1);
    if p.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(s as *const u8, p, len);
    *p.add(len) = 0;
    p as *mut std::os::raw::c_char
}

/// Creates a new arena, returning its id.
pub fn ffarena_create() -> Result<usize, AllocError> {
    alloc().create_arena()
}

/// Tears down an arena and every pool/allocation it owns. `arena_id == 0`
/// (the default arena) is always rejected.
pub fn ffarena_destroy(arena_id: usize) -> Result<(), AllocError> {
    alloc().destroy_arena(arena_id)
}

/// Allocates `size` bytes from a specific arena.
pub unsafe fn ffarena_alloc(arena_id: usize, size: usize) -> *mut u8 {
    match alloc().alloc(arena_id, size.max(1)) {
        Ok(p) => p.as_ptr(),
        Err(_) => std::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_free_roundtrip() {
        unsafe {
            let p = ffalloc(64);
            assert!(!p.is_null());
            std::ptr::write_bytes(p, 0x42, 64);
            fffree(p);
        }
    }

    #[test]
    fn calloc_zeroes_memory() {
        unsafe {
            let p = ffcalloc(8, 16);
            assert!(!p.is_null());
            for i in 0..128 {
                assert_eq!(*p.add(i), 0);
            }
            fffree(p);
        }
    }

    #[test]
    fn calloc_overflow_returns_null() {
        unsafe {
            assert!(ffcalloc(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn realloc_preserves_content() {
        unsafe {
            let p = ffalloc(16);
            std::ptr::write_bytes(p, 0xAA, 16);
            let q = ffrealloc(p, 256);
            assert!(!q.is_null());
            assert_ne!(p, q);
            for i in 0..16 {
                assert_eq!(*q.add(i), 0xAA);
            }
            fffree(q);
        }
    }

    #[test]
    fn realloc_returns_same_pointer_when_it_fits() {
        unsafe {
            let p = ffalloc(64);
            let usable = ffmalloc_usable_size(p);
            // Shrinking (and any size still within the existing slot) must
            // hand back the same address rather than allocate fresh.
            let q = ffrealloc(p, usable);
            assert_eq!(p, q);
            let r = ffrealloc(p, 1);
            assert_eq!(p, r);
            fffree(r);
        }
    }

    #[test]
    fn strdup_copies_and_terminates() {
        unsafe {
            let src = std::ffi::CString::new("hello").unwrap();
            let dup = ffstrdup(src.as_ptr());
            assert_eq!(std::ffi::CStr::from_ptr(dup).to_str().unwrap(), "hello");
            fffree(dup as *mut u8);
        }
    }
}
