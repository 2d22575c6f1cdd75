//! The heap: best-fit allocation, splitting, release and coalescing.
//!
//! The [`Heap`] owns every span obtained from the backing store and all
//! block metadata. Two intrusive lists thread through the block arena:
//!
//! ```text
//!                                    Free list
//!
//!                     next free block               next free block
//!                +---------------------+  +-------------------------------+
//!                |                     |  |                               |
//! +--------------|---------------------|--|---+      +--------------------|------------------+
//! |      | +-----|-+    +-------+    +-|--|-+ |      |      | +-------+ +-|----+   +-------+ |
//! | Span | | free  | -> | used  | -> | free | | ---> | Span | | used  | | free |   | used  | |
//! |      | +-------+    +-------+    +------+ |      |      | +-------+ +------+   +-------+ |
//! +--------------------------------------------+      +--------------------------------------+
//! ```
//!
//! Every block is on exactly one of the free list or the used list. The
//! lists carry membership only; the address-order adjacency chain inside
//! each span is separate, and it is what coalescing consults, so list
//! insertion order never influences which blocks merge.
//!
//! An address index maps live payload pointers back to their block
//! handles, making release O(1) and letting a failed lookup distinguish
//! "this memory is already free" from "this was never ours".

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use crate::arena::{Arena, BlockId};
use crate::backing::{HeapGrower, PlatformGrower, Span};
use crate::block::{ALIGNMENT, Block, MIN_BLOCK_SIZE};
use crate::error::{GrowError, ReleaseError};

/// A growable heap handing out best-fit blocks.
///
/// Mutating operations take `&mut self`, so exclusive access is enforced
/// by the borrow checker; callers that need sharing wrap the heap in
/// their own lock.
pub struct Heap<G: HeapGrower = PlatformGrower> {
    grower: G,
    spans: Vec<Span>,
    blocks: Arena<Block>,
    free_head: Option<BlockId>,
    used_head: Option<BlockId>,
    /// Payload address -> block handle, for every used block.
    used_index: HashMap<usize, BlockId>,
    total_size: usize,
    used_size: usize,
}

impl Heap<PlatformGrower> {
    /// Creates a heap with an initial backing span of at least
    /// `initial_size` bytes, requested from the OS.
    pub fn new(initial_size: usize) -> Result<Self, GrowError> {
        Self::with_grower(PlatformGrower::new(), initial_size)
    }
}

impl<G: HeapGrower> Heap<G> {
    /// Creates a heap served by `grower`, growing it once by at least
    /// `initial_size` bytes up front.
    pub fn with_grower(grower: G, initial_size: usize) -> Result<Self, GrowError> {
        let mut heap = Self {
            grower,
            spans: Vec::new(),
            blocks: Arena::new(),
            free_head: None,
            used_head: None,
            used_index: HashMap::new(),
            total_size: 0,
            used_size: 0,
        };
        heap.grow(initial_size)?;

        Ok(heap)
    }

    /// Returns at least `size` usable bytes, aligned to [`ALIGNMENT`], or
    /// `None` when `size` is zero or the backing store is exhausted.
    ///
    /// The returned region is disjoint from every other live allocation
    /// and stays valid until it is passed to [`Heap::release`].
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = round_request(size)?;

        let id = match self.find_best_fit(needed) {
            Some(id) => id,
            None => match self.grow(needed) {
                Ok(id) => id,
                Err(err) => {
                    log::warn!("allocation of {size} bytes failed: {err}");
                    return None;
                }
            },
        };

        self.split(id, needed);

        unlink(&mut self.blocks, &mut self.free_head, id);
        let (addr, block_size) = {
            let block = block_mut(&mut self.blocks, id);
            block.is_free = false;
            (block.addr, block.size)
        };
        push_front(&mut self.blocks, &mut self.used_head, id);
        self.used_index.insert(addr.as_ptr() as usize, id);
        self.used_size += block_size;

        log::debug!("allocated {block_size} bytes at {addr:p} for a request of {size}");
        Some(addr)
    }

    /// Returns a block to the heap and merges it with free neighbors.
    ///
    /// A null pointer is a no-op. Releasing memory that is already free
    /// or that this heap never handed out is rejected without touching
    /// any state, so the heap stays usable after the error.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;

        let Some(id) = self.used_index.remove(&addr) else {
            return Err(self.classify_unknown(addr));
        };

        unlink(&mut self.blocks, &mut self.used_head, id);
        let size = {
            let block = block_mut(&mut self.blocks, id);
            block.is_free = true;
            block.size
        };
        push_front(&mut self.blocks, &mut self.free_head, id);
        self.used_size -= size;

        log::debug!("released {size} bytes at {addr:#x}");
        self.coalesce(id);

        Ok(())
    }

    /// Total bytes acquired from the backing store.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes currently held by used blocks.
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Bytes currently sitting on the free list.
    pub fn free_size(&self) -> usize {
        self.total_size - self.used_size
    }

    /// Number of spans acquired from the backing store so far.
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Snapshot of the heap for diagnostic inspection. Read-only.
    pub fn stats(&self) -> HeapStats {
        let free_blocks = self.collect(self.free_head);
        let used_blocks = self.collect(self.used_head);

        // Every block lives on exactly one of the two lists.
        debug_assert_eq!(self.blocks.len(), free_blocks.len() + used_blocks.len());

        HeapStats {
            total: self.total_size,
            used: self.used_size,
            free: self.free_size(),
            free_blocks,
            used_blocks,
        }
    }

    /// Decides what went wrong with a release of `addr`, which is not
    /// the base of any used block. Falling inside free memory means the
    /// caller freed it (or a block containing it) before; anything else
    /// never came from this heap.
    pub(crate) fn classify_unknown(&self, addr: usize) -> ReleaseError {
        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            let block = block_ref(&self.blocks, id);
            if block.contains(addr) {
                log::warn!("double free detected at {addr:#x}");
                return ReleaseError::DoubleFree { addr };
            }
            cursor = block.list_next;
        }

        log::warn!("attempt to free unrecorded pointer {addr:#x}");
        ReleaseError::ForeignPointer { addr }
    }

    /// Acquires a fresh span of at least `min_bytes` and installs it as a
    /// single free block, prepended to the free list.
    fn grow(&mut self, min_bytes: usize) -> Result<BlockId, GrowError> {
        let span = self.grower.grow(min_bytes)?;

        let id = self.blocks.insert(Block::new(span.base(), span.size()));
        push_front(&mut self.blocks, &mut self.free_head, id);
        self.total_size += span.size();
        self.spans.push(span);

        log::debug!("heap grew by {} bytes to {}", span.size(), self.total_size);
        Ok(id)
    }

    /// Best-fit scan: the free block with the least slack for `needed`
    /// bytes, ties broken by list order, early exit on an exact fit.
    fn find_best_fit(&self, needed: usize) -> Option<BlockId> {
        let mut best: Option<(BlockId, usize)> = None;

        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            let block = block_ref(&self.blocks, id);
            if block.size >= needed {
                let slack = block.size - needed;
                if slack == 0 {
                    return Some(id);
                }
                if best.is_none_or(|(_, least)| slack < least) {
                    best = Some((id, slack));
                }
            }
            cursor = block.list_next;
        }

        best.map(|(id, _)| id)
    }

    /// Carves `needed` bytes off the front of the free block `id`. The
    /// remainder becomes a new free block right after it in address
    /// order, unless it would be too small to ever satisfy a request.
    fn split(&mut self, id: BlockId, needed: usize) {
        let (addr, size, neighbor_next) = {
            let block = block_ref(&self.blocks, id);
            (block.addr, block.size, block.neighbor_next)
        };

        let remainder = size - needed;
        if remainder < MIN_BLOCK_SIZE {
            return;
        }

        // `needed` is aligned and within the block, so the remainder
        // starts at a valid, aligned address inside the same span.
        let remainder_addr = unsafe { NonNull::new_unchecked(addr.as_ptr().add(needed)) };
        let mut rest = Block::new(remainder_addr, remainder);
        rest.neighbor_prev = Some(id);
        rest.neighbor_next = neighbor_next;
        let rest_id = self.blocks.insert(rest);

        if let Some(next) = neighbor_next {
            block_mut(&mut self.blocks, next).neighbor_prev = Some(rest_id);
        }
        {
            let block = block_mut(&mut self.blocks, id);
            block.size = needed;
            block.neighbor_next = Some(rest_id);
        }
        push_front(&mut self.blocks, &mut self.free_head, rest_id);

        log::debug!("split off a {remainder}-byte remainder at {remainder_addr:p}");
    }

    /// Merges the freshly freed block `id` with adjacent free blocks,
    /// forward then backward, until no free neighbor remains.
    fn coalesce(&mut self, id: BlockId) {
        while self.merge_with_next(id) {}

        let mut current = id;
        while let Some(prev) = block_ref(&self.blocks, current).neighbor_prev {
            if !block_ref(&self.blocks, prev).is_free {
                break;
            }
            self.merge_with_next(prev);
            current = prev;
        }
    }

    /// Absorbs the address-order successor of `id` into it if that
    /// successor is free. The absorbed block leaves the free list and its
    /// arena slot is vacated, so stale handles to it stop resolving.
    fn merge_with_next(&mut self, id: BlockId) -> bool {
        let Some(next_id) = block_ref(&self.blocks, id).neighbor_next else {
            return false;
        };
        if !block_ref(&self.blocks, next_id).is_free {
            return false;
        }

        unlink(&mut self.blocks, &mut self.free_head, next_id);
        let next = self.blocks.remove(next_id).expect("stale block handle");
        if let Some(after) = next.neighbor_next {
            block_mut(&mut self.blocks, after).neighbor_prev = Some(id);
        }

        let block = block_mut(&mut self.blocks, id);
        block.size += next.size;
        block.neighbor_next = next.neighbor_next;

        log::debug!(
            "coalesced {} bytes into the block at {:#x}",
            next.size,
            block.addr_usize()
        );
        true
    }

    fn collect(&self, head: Option<BlockId>) -> Vec<BlockInfo> {
        let mut infos = Vec::new();

        let mut cursor = head;
        while let Some(id) = cursor {
            let block = block_ref(&self.blocks, id);
            infos.push(BlockInfo {
                addr: block.addr_usize(),
                size: block.size,
            });
            cursor = block.list_next;
        }

        infos
    }
}

/// Rounds a request up to the alignment unit and the minimum block size.
/// `None` on arithmetic overflow, which no backing store could satisfy
/// anyway.
fn round_request(size: usize) -> Option<usize> {
    let aligned = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);

    Some(aligned.max(MIN_BLOCK_SIZE))
}

fn block_ref(blocks: &Arena<Block>, id: BlockId) -> &Block {
    blocks.get(id).expect("stale block handle")
}

fn block_mut(blocks: &mut Arena<Block>, id: BlockId) -> &mut Block {
    blocks.get_mut(id).expect("stale block handle")
}

/// Prepends `id` to the list rooted at `head`.
fn push_front(blocks: &mut Arena<Block>, head: &mut Option<BlockId>, id: BlockId) {
    if let Some(old_head) = *head {
        block_mut(blocks, old_head).list_prev = Some(id);
    }

    let block = block_mut(blocks, id);
    block.list_prev = None;
    block.list_next = *head;
    *head = Some(id);
}

/// Detaches `id` from the list rooted at `head`, clearing its links.
fn unlink(blocks: &mut Arena<Block>, head: &mut Option<BlockId>, id: BlockId) {
    let (prev, next) = {
        let block = block_ref(blocks, id);
        (block.list_prev, block.list_next)
    };

    match prev {
        Some(prev) => block_mut(blocks, prev).list_next = next,
        None => *head = next,
    }
    if let Some(next) = next {
        block_mut(blocks, next).list_prev = prev;
    }

    let block = block_mut(blocks, id);
    block.list_prev = None;
    block.list_next = None;
}

/// Address and size of one block, as listed in [`HeapStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub size: usize,
}

/// Point-in-time view of the heap produced by [`Heap::stats`].
///
/// The `Display` rendering is meant for humans; its exact format is not
/// a stable contract.
#[derive(Debug, Clone)]
pub struct HeapStats {
    /// Bytes ever acquired from the backing store.
    pub total: usize,
    /// Bytes held by used blocks.
    pub used: usize,
    /// Bytes held by free blocks.
    pub free: usize,
    /// Free blocks in list order.
    pub free_blocks: Vec<BlockInfo>,
    /// Used blocks in list order.
    pub used_blocks: Vec<BlockInfo>,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory statistics:")?;
        writeln!(f, "Total heap size: {} bytes", self.total)?;
        writeln!(f, "Used size: {} bytes", self.used)?;
        writeln!(f, "Free size: {} bytes", self.free)?;

        writeln!(f, "\nFree blocks:")?;
        for block in &self.free_blocks {
            writeln!(f, "Block at {:#x}, size: {}", block.addr, block.size)?;
        }

        writeln!(f, "\nUsed blocks:")?;
        for block in &self.used_blocks {
            writeln!(f, "Block at {:#x}, size: {}", block.addr, block.size)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::GROWTH_FLOOR;
    use crate::backing::testing::BufferGrower;

    fn small_heap() -> Heap<BufferGrower> {
        Heap::with_grower(BufferGrower::new(1024 * 1024), GROWTH_FLOOR).unwrap()
    }

    /// Conservation: the span bytes are exactly partitioned between the
    /// two lists.
    fn assert_conserved<G: HeapGrower>(heap: &Heap<G>) {
        let stats = heap.stats();
        let free_sum: usize = stats.free_blocks.iter().map(|b| b.size).sum();
        let used_sum: usize = stats.used_blocks.iter().map(|b| b.size).sum();

        assert_eq!(stats.used, used_sum);
        assert_eq!(stats.free, free_sum);
        assert_eq!(stats.total, used_sum + free_sum);
    }

    #[test]
    fn zero_size_request_is_a_noop() {
        let mut heap = small_heap();

        assert!(heap.allocate(0).is_none());
        assert_eq!(heap.used_size(), 0);
        assert_conserved(&heap);
    }

    #[test]
    fn payloads_are_aligned() {
        let mut heap = small_heap();

        for size in [1, 3, 8, 13, 40, 100, 511] {
            let ptr = heap.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0, "size {size}");
        }
    }

    #[test]
    fn live_allocations_do_not_overlap() {
        let mut heap = small_heap();

        let sizes = [40usize, 100, 8, 256, 17, 64];
        let ranges: Vec<(usize, usize)> = sizes
            .iter()
            .map(|&size| {
                let addr = heap.allocate(size).unwrap().as_ptr() as usize;
                (addr, addr + size)
            })
            .collect();

        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{a:?} overlaps {b:?}");
            }
        }
        assert_conserved(&heap);
    }

    #[test]
    fn released_memory_is_reused() {
        let mut heap = small_heap();

        let first = heap.allocate(64).unwrap();
        heap.release(first.as_ptr()).unwrap();
        let second = heap.allocate(64).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn best_fit_prefers_the_tightest_hole() {
        let mut heap = small_heap();

        let big = heap.allocate(256).unwrap();
        let _guard1 = heap.allocate(64).unwrap();
        let small = heap.allocate(64).unwrap();
        let _guard2 = heap.allocate(64).unwrap();

        heap.release(big.as_ptr()).unwrap();
        heap.release(small.as_ptr()).unwrap();

        // Holes: 256 bytes, 64 bytes, and the large span tail. An exact
        // 64-byte request must land in the 64-byte hole.
        assert_eq!(heap.allocate(64).unwrap(), small);
        assert_conserved(&heap);
    }

    #[test]
    fn remainders_below_the_minimum_are_not_split_off() {
        let mut heap = small_heap();

        let hole = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();
        heap.release(hole.as_ptr()).unwrap();

        // 40 rounds to 40; the 24-byte remainder of the 64-byte hole is
        // below MIN_BLOCK_SIZE, so the whole hole is handed out.
        let ptr = heap.allocate(40).unwrap();
        assert_eq!(ptr, hole);

        let stats = heap.stats();
        let block = stats
            .used_blocks
            .iter()
            .find(|b| b.addr == ptr.as_ptr() as usize)
            .unwrap();
        assert_eq!(block.size, 64);
        assert_conserved(&heap);
    }

    #[test]
    fn splitting_carves_the_remainder() {
        let mut heap = small_heap();

        let first = heap.allocate(64).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.free_blocks.len(), 1);
        assert_eq!(stats.free_blocks[0].size, GROWTH_FLOOR - 64);
        assert_eq!(stats.free_blocks[0].addr, first.as_ptr() as usize + 64);

        let second = heap.allocate(64).unwrap();
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 64);
    }

    #[test]
    fn coalescing_merges_adjacent_runs() {
        // Three equal neighbors freed in any order must fuse back into
        // one block that satisfies their combined size without growth.
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mut heap = small_heap();
            let blocks = [
                heap.allocate(128).unwrap(),
                heap.allocate(128).unwrap(),
                heap.allocate(128).unwrap(),
            ];
            let _guard = heap.allocate(64).unwrap();

            for &i in &order {
                heap.release(blocks[i].as_ptr()).unwrap();
            }

            let total_before = heap.total_size();
            let merged = heap.allocate(384).unwrap();

            assert_eq!(merged, blocks[0], "free order {order:?}");
            assert_eq!(heap.total_size(), total_before, "free order {order:?}");
            assert_conserved(&heap);
        }
    }

    #[test]
    fn release_null_is_a_noop() {
        let mut heap = small_heap();

        assert!(heap.release(std::ptr::null_mut()).is_ok());
        assert_conserved(&heap);
    }

    #[test]
    fn double_free_is_detected_and_harmless() {
        let mut heap = small_heap();

        let ptr = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();
        heap.release(ptr.as_ptr()).unwrap();

        let addr = ptr.as_ptr() as usize;
        assert_eq!(
            heap.release(ptr.as_ptr()),
            Err(ReleaseError::DoubleFree { addr })
        );
        assert_conserved(&heap);

        // The heap must remain fully usable afterwards.
        let next = heap.allocate(48).unwrap();
        heap.release(next.as_ptr()).unwrap();
        assert_conserved(&heap);
    }

    #[test]
    fn double_free_is_detected_after_coalescing() {
        let mut heap = small_heap();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();

        heap.release(a.as_ptr()).unwrap();
        // b merges backward into a; its own block ceases to exist.
        heap.release(b.as_ptr()).unwrap();

        let addr = b.as_ptr() as usize;
        assert_eq!(
            heap.release(b.as_ptr()),
            Err(ReleaseError::DoubleFree { addr })
        );
        assert_conserved(&heap);
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mut heap = small_heap();
        let ptr = heap.allocate(64).unwrap();

        let mut local = 0u64;
        let foreign = (&mut local as *mut u64).cast::<u8>();
        assert_eq!(
            heap.release(foreign),
            Err(ReleaseError::ForeignPointer {
                addr: foreign as usize
            })
        );

        // An interior pointer is not the base of any allocation.
        let interior = unsafe { ptr.as_ptr().add(8) };
        assert_eq!(
            heap.release(interior),
            Err(ReleaseError::ForeignPointer {
                addr: interior as usize
            })
        );
        assert_conserved(&heap);
    }

    #[test]
    fn growth_extends_the_heap() {
        let mut heap = small_heap();
        assert_eq!(heap.total_size(), GROWTH_FLOOR);

        let ptr = heap.allocate(8000).unwrap();
        assert!(heap.total_size() > GROWTH_FLOOR);
        assert_eq!(heap.span_count(), 2);
        assert_conserved(&heap);

        unsafe {
            ptr.as_ptr().write(1);
            ptr.as_ptr().add(7999).write(2);
        }
    }

    #[test]
    fn exhausted_backing_store_returns_none() {
        let mut heap =
            Heap::with_grower(BufferGrower::new(GROWTH_FLOOR), GROWTH_FLOOR).unwrap();

        assert!(heap.allocate(2 * GROWTH_FLOOR).is_none());
        assert_conserved(&heap);

        // Out-of-memory is recoverable: small requests still succeed.
        assert!(heap.allocate(64).is_some());
        assert_conserved(&heap);
    }

    #[test]
    fn stats_snapshot_matches_the_lists() {
        let mut heap = small_heap();
        heap.allocate(40).unwrap();
        heap.allocate(100).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.used_blocks.len(), 2);
        assert_eq!(stats.free_blocks.len(), 1);
        assert_eq!(stats.total, stats.used + stats.free);

        let report = stats.to_string();
        assert!(report.contains("Total heap size"));
        assert!(report.contains("Used blocks"));
    }

    #[test]
    fn conservation_holds_under_churn() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let mut heap =
            Heap::with_grower(BufferGrower::new(8 * 1024 * 1024), GROWTH_FLOOR).unwrap();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for _ in 0..2000 {
            let r = lcg(&mut rng);
            if r % 2 == 0 || live.is_empty() {
                let size = ((r >> 8) as usize % 2048).max(1);
                if let Some(ptr) = heap.allocate(size) {
                    live.push((ptr, size));
                }
            } else {
                let idx = (r >> 16) as usize % live.len();
                let (ptr, _) = live.swap_remove(idx);
                heap.release(ptr.as_ptr()).unwrap();
            }

            assert_conserved(&heap);
        }

        for (ptr, _) in live {
            heap.release(ptr.as_ptr()).unwrap();
        }
        assert_eq!(heap.used_size(), 0);
        assert_conserved(&heap);
    }
}
