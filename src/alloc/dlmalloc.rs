use std::ptr::NonNull;

use crate::{
    alloc::raw::{RawAllocator, BLOCK_ALIGN},
    error::AllocError,
    util::hint::cold,
};

// https://gee.cs.oswego.edu/dl/html/malloc.html

/// A private `dlmalloc()` heap, separate from the process heap. Every
/// [`DlMalloc`] owns its own arena of `mmap()`ed segments, so a whole
/// [`Ta`](super::Ta) can be kept away from everything else in the process.
pub struct DlMalloc(dlmalloc::Dlmalloc);

impl DlMalloc {
    pub const fn new() -> Self {
        Self(dlmalloc::Dlmalloc::new())
    }
}

impl Default for DlMalloc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DlMalloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DlMalloc")
    }
}

fn checked(data: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
    match NonNull::new(data) {
        Some(data) => Ok(data),
        None => cold(|| Err(AllocError::OutOfMemory { size })),
    }
}

// SAFETY: every request asks dlmalloc for `BLOCK_ALIGN` alignment, and its
// `realloc()` returns null without freeing when it cannot grow.
unsafe impl RawAllocator for DlMalloc {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: `size` is non-zero and `BLOCK_ALIGN` is a power of two
        checked(unsafe { self.0.malloc(size, BLOCK_ALIGN) }, size)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: as for `allocate()`
        checked(unsafe { self.0.calloc(size, BLOCK_ALIGN) }, size)
    }

    unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: caller guarantees `data` is a live block of `old_size`
        // bytes from this heap, which was allocated with `BLOCK_ALIGN`
        checked(
            unsafe { self.0.realloc(data.as_ptr(), old_size, BLOCK_ALIGN, new_size) },
            new_size,
        )
    }

    unsafe fn deallocate(&mut self, data: NonNull<u8>, size: usize) {
        // SAFETY: as for `reallocate()`
        unsafe { self.0.free(data.as_ptr(), size, BLOCK_ALIGN) }
    }
}
