//! Backing allocator for thread regions.

use alloc::alloc::{Layout, alloc, dealloc};
use core::ptr::NonNull;

use crate::REGION_ALIGN;

/// A thread-safe byte allocator for thread regions.
///
/// # Safety
///
/// Implementations must return memory that is aligned to at least
/// [`REGION_ALIGN`] bytes, valid for reads and writes of `size` bytes, and not
/// aliased by any other live allocation. They must be safe to call from several
/// threads at once.
pub unsafe trait RegionAlloc {
    /// Allocates `size` bytes, or returns `None` when memory is exhausted.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a region returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a previous `alloc` call on the same
    /// allocator, and the region must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize);
}

/// The Rust global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalHeap;

// SAFETY: Every layout requests `REGION_ALIGN` alignment, and the global
// allocator is thread-safe.
unsafe impl RegionAlloc for GlobalHeap {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN).ok()?;

        // SAFETY: `layout` has a non-zero size.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: The same size and alignment were validated by `alloc`.
        let layout = unsafe { Layout::from_size_align_unchecked(size, REGION_ALIGN) };

        // SAFETY: The caller guarantees `ptr` came from `alloc` with this layout.
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(target_arch = "wasm32")]
pub use self::libc::LibcMalloc;

#[cfg(target_arch = "wasm32")]
mod libc {
    use core::{ffi::c_void, ptr::NonNull};

    use super::RegionAlloc;

    // SAFETY: Provided by the C runtime linked into the module.
    unsafe extern "C" {
        fn malloc(size: usize) -> *mut c_void;
        fn free(ptr: *mut c_void);
    }

    /// The C runtime's `malloc`.
    ///
    /// Regions from this allocator can be released by the C runtime's thread
    /// teardown with a plain `free(map_base)`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LibcMalloc;

    // SAFETY: wasm32 `malloc` returns 16-byte aligned memory, and the
    // shared-memory build of the C runtime locks around it.
    unsafe impl RegionAlloc for LibcMalloc {
        fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
            // SAFETY: `malloc` accepts any size.
            NonNull::new(unsafe { malloc(size) }.cast())
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, _size: usize) {
            // SAFETY: The caller guarantees `ptr` came from `malloc`.
            unsafe { free(ptr.as_ptr().cast()) }
        }
    }
}
