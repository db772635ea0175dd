use crate::error::AllocError;

/// `element_size * count`, or [`AllocError::SizeOverflow`] if that does not
/// fit in a `usize`. Every array allocation goes through here, because `count`
/// usually comes from somewhere we don't trust.
pub const fn calc_array_size(element_size: usize, count: usize) -> Result<usize, AllocError> {
    match element_size.checked_mul(count) {
        Some(size) => Ok(size),
        None => Err(AllocError::SizeOverflow {
            element_size,
            count,
        }),
    }
}

/// Number of bytes actually requested from the system allocator for a node of
/// `size` usable bytes. `malloc(0)` is allowed to return null, which we would
/// read as out of memory, so every block is at least one byte.
pub const fn block_size(size: usize) -> usize {
    if size == 0 {
        1
    } else {
        size
    }
}
