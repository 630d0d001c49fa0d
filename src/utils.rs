//! Helper functions that don't belong to any concrete module of the allocator.

/// Rounds `to_be_aligned` up to a multiple of `alignment`, which must be a power of two.
///
/// This is used to round chunk sizes up to a multiple of the page size.
/// Returns `None` if the rounded value does not fit in a `usize`.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(to_be_aligned.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Rounds `addr` up to a multiple of `alignment`, which does not have to be
/// a power of two. Pools use it to move their cursor to the next pointer
/// boundary.
#[inline]
pub fn align_to(addr: usize, alignment: usize) -> usize {
    match addr % alignment {
        0 => addr,
        misalignment => addr + (alignment - misalignment),
    }
}
