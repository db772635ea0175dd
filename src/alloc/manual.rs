use std::ptr::NonNull;

use crate::{alloc::raw::RawAllocator, error::AllocError, util::hint::cold};

/// The C library's `malloc()` family, with no metadata of its own. This is the
/// default backend of a [`Ta`](super::Ta).
#[derive(Debug, Default, Clone, Copy)]
pub struct Malloc;

fn checked(data: *mut libc::c_void, size: usize) -> Result<NonNull<u8>, AllocError> {
    match NonNull::new(data as *mut u8) {
        Some(data) => Ok(data),
        None => cold(|| Err(AllocError::OutOfMemory { size })),
    }
}

// SAFETY: `malloc()` returns blocks aligned for any fundamental type, which
// covers `BLOCK_ALIGN`, and `realloc()` leaves the old block alone on failure.
unsafe impl RawAllocator for Malloc {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: `malloc()` has no preconditions
        checked(unsafe { libc::malloc(size) }, size)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: `calloc()` has no preconditions and does its own overflow
        // check on `1 * size`
        checked(unsafe { libc::calloc(1, size) }, size)
    }

    unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        _: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: caller guarantees `data` came from `malloc()` and is live
        checked(unsafe { libc::realloc(data.as_ptr() as _, new_size) }, new_size)
    }

    unsafe fn deallocate(&mut self, data: NonNull<u8>, _: usize) {
        // SAFETY: caller guarantees `data` came from `malloc()` and is live
        unsafe { libc::free(data.as_ptr() as _) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realloc_keeps_the_prefix() {
        let mut alloc = Malloc;
        let data = alloc.allocate(4).unwrap();
        unsafe {
            data.as_ptr().copy_from_nonoverlapping(b"abcd".as_ptr(), 4);
            let data = alloc.reallocate(data, 4, 4096).unwrap();
            assert_eq!(std::slice::from_raw_parts(data.as_ptr(), 4), b"abcd");
            alloc.deallocate(data, 4096);
        }
    }

    #[test]
    fn impossible_requests_fail_instead_of_returning_null() {
        let mut alloc = Malloc;
        assert_eq!(
            alloc.allocate(usize::MAX),
            Err(AllocError::OutOfMemory { size: usize::MAX })
        );
    }
}
