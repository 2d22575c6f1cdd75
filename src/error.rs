//! Error types surfaced by the allocator.
//!
//! Every error here is recoverable by design. A failed growth leaves the
//! heap exactly as it was, and a rejected release never touches the block
//! lists, so callers can keep using the heap after reporting the problem.

use thiserror::Error;

/// The backing store could not satisfy a growth request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrowError {
    /// The OS denied the memory request (out of address space or memory).
    #[error("backing store refused to grow by {requested} bytes")]
    Exhausted {
        /// Number of bytes that were requested from the OS.
        requested: usize,
    },
}

/// A release call was rejected.
///
/// The heap state is left unchanged in both cases; these exist to aid
/// debugging, not to crash the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// The address belongs to memory that is already free.
    #[error("double free detected at {addr:#x}")]
    DoubleFree { addr: usize },

    /// The address was never handed out by this heap, or points into the
    /// middle of an allocation instead of at its start.
    #[error("attempt to free unrecorded pointer {addr:#x}")]
    ForeignPointer { addr: usize },
}
