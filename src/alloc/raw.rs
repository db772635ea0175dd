//! The seam between a [`Ta`](super::Ta) and whatever actually hands out
//! memory.
//!
//! A [`Ta`](super::Ta) never touches the system heap directly; it asks its
//! [`RawAllocator`] for flat, untyped blocks and keeps all tree bookkeeping to
//! itself. That keeps backends tiny (see [`Malloc`](super::Malloc) and
//! [`DlMalloc`](super::DlMalloc)) and lets decorators such as [`Limited`] sit in
//! between without knowing anything about trees.

use std::{mem, ptr::NonNull};

use crate::{
    alloc::{dlmalloc::DlMalloc, manual::Malloc},
    error::AllocError,
    util::hint::cold,
};

/// Alignment of every block returned by a [`RawAllocator`]. This is the
/// alignment `malloc()` promises on the platforms we care about.
pub const BLOCK_ALIGN: usize = 2 * mem::size_of::<usize>();

/// A source of raw byte blocks.
///
/// # Safety
///
/// Implementors must guarantee that
/// - a successful `allocate()`/`allocate_zeroed()`/`reallocate()` returns a
///   block valid for reads and writes of `size` bytes, aligned to
///   [`BLOCK_ALIGN`], and not overlapping any other live block
/// - a failed `reallocate()` leaves the original block untouched and live
/// - `size` is never 0 when called by this crate, so implementors need not
///   handle it
pub unsafe trait RawAllocator {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let data = self.allocate(size)?;
        // SAFETY: `allocate()` promises `size` writable bytes
        unsafe { data.as_ptr().write_bytes(0, size) };
        Ok(data)
    }

    /// Grow or shrink `data` to `new_size` bytes, preserving the first
    /// `min(old_size, new_size)` bytes. The block may move.
    ///
    /// # Safety
    ///
    /// `data` must be a live block from this allocator, of `old_size` bytes.
    unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `data` must be a live block from this allocator, of `size` bytes. It is
    /// dead afterwards.
    unsafe fn deallocate(&mut self, data: NonNull<u8>, size: usize);
}

/// Caps the number of bytes live in the wrapped allocator at `limit`. Requests
/// beyond the cap fail with [`AllocError::OutOfMemory`] exactly as if the
/// system had run dry, which also makes this the way to provoke allocation
/// failure on purpose.
#[derive(Debug)]
pub struct Limited<A> {
    inner: A,
    limit: usize,
    used: usize,
}

impl<A> Limited<A> {
    pub const fn new(inner: A, limit: usize) -> Self {
        Self {
            inner,
            limit,
            used: 0,
        }
    }

    /// Bytes currently live through this allocator
    pub const fn used(&self) -> usize {
        self.used
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Change the cap. Lowering it below [`Self::used()`] does not free
    /// anything, it only makes every further growth fail.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub const fn inner(&self) -> &A {
        &self.inner
    }

    fn admit(&self, release: usize, request: usize) -> Result<(), AllocError> {
        let after = self.used - release;
        if self.limit.saturating_sub(after) >= request {
            Ok(())
        } else {
            cold(|| Err(AllocError::OutOfMemory { size: request }))
        }
    }
}

// SAFETY: every block comes straight from `inner`
unsafe impl<A> RawAllocator for Limited<A>
where
    A: RawAllocator,
{
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.admit(0, size)?;
        let data = self.inner.allocate(size)?;
        self.used += size;
        Ok(data)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.admit(0, size)?;
        let data = self.inner.allocate_zeroed(size)?;
        self.used += size;
        Ok(data)
    }

    unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.admit(old_size, new_size)?;
        // SAFETY: same contract as the caller's
        let data = unsafe { self.inner.reallocate(data, old_size, new_size) }?;
        self.used = self.used - old_size + new_size;
        Ok(data)
    }

    unsafe fn deallocate(&mut self, data: NonNull<u8>, size: usize) {
        // SAFETY: same contract as the caller's
        unsafe { self.inner.deallocate(data, size) };
        self.used -= size;
    }
}

/// One of the system backends, picked at runtime (see
/// [`Config`](crate::Config)).
#[derive(Debug)]
pub enum SystemAlloc {
    Malloc(Malloc),
    DlMalloc(DlMalloc),
}

// SAFETY: forwards to backends that uphold the contract themselves
unsafe impl RawAllocator for SystemAlloc {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self {
            SystemAlloc::Malloc(a) => a.allocate(size),
            SystemAlloc::DlMalloc(a) => a.allocate(size),
        }
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self {
            SystemAlloc::Malloc(a) => a.allocate_zeroed(size),
            SystemAlloc::DlMalloc(a) => a.allocate_zeroed(size),
        }
    }

    unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: same contract as the caller's
        unsafe {
            match self {
                SystemAlloc::Malloc(a) => a.reallocate(data, old_size, new_size),
                SystemAlloc::DlMalloc(a) => a.reallocate(data, old_size, new_size),
            }
        }
    }

    unsafe fn deallocate(&mut self, data: NonNull<u8>, size: usize) {
        // SAFETY: same contract as the caller's
        unsafe {
            match self {
                SystemAlloc::Malloc(a) => a.deallocate(data, size),
                SystemAlloc::DlMalloc(a) => a.deallocate(data, size),
            }
        }
    }
}
