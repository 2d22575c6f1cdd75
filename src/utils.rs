//! Helper functions that don't particularly belong to any concrete module
//! of the allocator.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// Used to align block sizes to [`crate::ALIGNMENT`] and growth requests
/// to the OS page size. `alignment` must be a power of two.
pub(crate) fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());

    (to_be_aligned + alignment - 1) & !(alignment - 1)
}
