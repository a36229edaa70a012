//! 64-byte-aligned system allocation for host memory kinds

use std::alloc::{alloc, dealloc, Layout};
use std::ffi::c_void;

use super::Ptr;

/// Host allocations are cache-line aligned; this also satisfies the widest
/// SIMD load the JIT emits.
pub const HOST_ALIGN: usize = 64;

/// Allocate `size` bytes aligned to [`HOST_ALIGN`]. Returns `None` when the
/// system allocator fails. `size` must be nonzero (the pool never requests
/// zero-byte blocks).
pub fn aligned_alloc(size: usize) -> Option<Ptr> {
    let layout = Layout::from_size_align(size, HOST_ALIGN).ok()?;
    // SAFETY: layout has nonzero size by the caller's contract.
    let raw = unsafe { alloc(layout) };
    if raw.is_null() {
        None
    } else {
        Some(Ptr::from_raw(raw as *mut c_void))
    }
}

/// Free a block obtained from [`aligned_alloc`] with the same `size`.
pub fn aligned_free(ptr: Ptr, size: usize) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: ptr was returned by aligned_alloc(size); the layout matches.
    unsafe {
        let layout = Layout::from_size_align_unchecked(size, HOST_ALIGN);
        dealloc(ptr.as_raw() as *mut u8, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned() {
        let ptr = aligned_alloc(256).expect("host allocation failed");
        assert_eq!(ptr.addr() % HOST_ALIGN, 0);
        aligned_free(ptr, 256);
    }

    #[test]
    fn free_null_is_noop() {
        aligned_free(Ptr::NULL, 64);
    }

    #[test]
    fn alloc_is_writable() {
        let ptr = aligned_alloc(64).expect("host allocation failed");
        // SAFETY: freshly allocated 64-byte block.
        unsafe {
            std::ptr::write_bytes(ptr.as_raw() as *mut u8, 0xAB, 64);
            assert_eq!(*(ptr.as_raw() as *const u8), 0xAB);
        }
        aligned_free(ptr, 64);
    }
}
