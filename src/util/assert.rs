/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}

/// Test if `align` is a usable alignment for the blocks a
/// [`RawAllocator`](crate::alloc::RawAllocator) hands out.
pub const fn fits_block_align(align: usize) -> bool {
    align <= crate::alloc::BLOCK_ALIGN
}
