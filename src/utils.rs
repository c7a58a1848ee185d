//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// Alignment of every chunk header and every pointer handed to the user.
pub const ALIGNMENT: usize = 16;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// Used to round page group lengths to a multiple of the page size and
/// chunk sizes to a multiple of [`ALIGNMENT`]. Returns `None` if rounding up
/// would overflow.
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    debug_assert!(aligment.is_power_of_two());
    Some(to_be_aligned.checked_add(aligment - 1)? & !(aligment - 1))
}
