use thiserror::Error;

/// Errors surfaced by the allocator.
///
/// Every operation either completes fully or fails with one of these and
/// leaves the heap exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The [`crate::PageSource`] declined to map more pages.
    #[error("out of memory: the operating system declined to map more pages")]
    OutOfMemory,
    /// Computing the total size of the request overflowed `usize`.
    #[error("requested size overflows the address space")]
    Overflow,
    /// The pointer is not the start of a chunk currently in use.
    /// Catches double frees, interior pointers and foreign pointers.
    #[error("pointer does not refer to a live allocation")]
    InvalidPointer,
    /// The requested alignment is not a power of two.
    #[error("alignment must be a power of two")]
    InvalidAlignment,
    /// The region was not reserved through the page source.
    #[error("region was not reserved through this page source")]
    InvalidRegion,
}
