//! Block metadata.
//!
//! A block is a contiguous run of bytes inside one span. Its record lives
//! in the block arena, not in front of the payload, so the full `size`
//! bytes starting at `addr` belong to the caller:
//!
//! ```text
//!          Span (one growth from the backing store)
//! +--------------------+-----------+--------------------------+
//! |     Block A        |  Block B  |         Block C          |
//! |     (used)         |  (free)   |         (used)           |
//! +--------------------+-----------+--------------------------+
//! ^ addr A             ^ addr B    ^ addr C
//!
//!   arena:  [ A: size, used, neighbors(-, B), list links ]
//!           [ B: size, free, neighbors(A, C), list links ]
//!           [ C: size, used, neighbors(B, -), list links ]
//! ```
//!
//! Blocks of a span tile it exactly: each block starts where its
//! predecessor ends, and the sizes sum to the span size. That adjacency
//! chain (`neighbor_prev` / `neighbor_next`) is what coalescing walks; it
//! is kept strictly separate from the membership links
//! (`list_prev` / `list_next`), which thread the block into exactly one
//! of the free list or the used list at any instant.

use std::mem;
use std::ptr::NonNull;

use crate::arena::BlockId;

/// Alignment unit for every payload address and block size.
pub const ALIGNMENT: usize = mem::size_of::<usize>();

/// Smallest block worth carving. A split only happens when the remainder
/// could stand on its own at this size; anything smaller stays attached
/// to the allocation that caused the split.
pub(crate) const MIN_BLOCK_SIZE: usize = 4 * ALIGNMENT;

pub(crate) struct Block {
    /// Total bytes of the block. Always a multiple of [`ALIGNMENT`] and
    /// at least [`MIN_BLOCK_SIZE`]. This is the authoritative distance to
    /// the next adjacent block; it only ever changes together with the
    /// adjacency links.
    pub size: usize,
    /// Base address of the block inside its span. Doubles as the payload
    /// pointer handed to the caller.
    pub addr: NonNull<u8>,
    /// Whether the block is on the free list.
    pub is_free: bool,
    /// Address-order predecessor within the same span.
    pub neighbor_prev: Option<BlockId>,
    /// Address-order successor within the same span.
    pub neighbor_next: Option<BlockId>,
    /// Previous block in the free or used list.
    pub list_prev: Option<BlockId>,
    /// Next block in the free or used list.
    pub list_next: Option<BlockId>,
}

impl Block {
    /// Creates a detached free block covering `size` bytes at `addr`.
    pub(crate) fn new(addr: NonNull<u8>, size: usize) -> Self {
        Self {
            size,
            addr,
            is_free: true,
            neighbor_prev: None,
            neighbor_next: None,
            list_prev: None,
            list_next: None,
        }
    }

    /// Base address as an integer, for index keys and reports.
    pub(crate) fn addr_usize(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Whether `addr` falls inside this block's byte range.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.addr_usize();
        addr >= base && addr < base + self.size
    }
}
