//! Provenance tracking on top of the heap.
//!
//! [`TrackedHeap`] wraps a [`Heap`] and remembers, for every live
//! allocation, how many bytes were requested and which source location
//! asked for them. That record is the basis for leak auditing and for a
//! stricter release path: a pointer without a record is rejected before
//! the structural free ever runs, so a garbage pointer can never be
//! misread as a block and corrupt unrelated memory.
//!
//! The safety model stays advisory. Nothing here prevents a caller from
//! keeping a pointer after releasing it; the layer only detects and
//! reports the misuse.

use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;

use crate::backing::{HeapGrower, PlatformGrower};
use crate::error::{GrowError, ReleaseError};
use crate::heap::{Heap, HeapStats};

/// What the tracker knows about one live allocation.
struct Record {
    size: usize,
    site: &'static Location<'static>,
}

/// Heap wrapper with per-allocation provenance records.
pub struct TrackedHeap<G: HeapGrower = PlatformGrower> {
    heap: Heap<G>,
    records: HashMap<usize, Record>,
}

impl TrackedHeap<PlatformGrower> {
    /// Creates a tracked heap over an OS-backed [`Heap`] with an initial
    /// span of at least `initial_size` bytes.
    pub fn new(initial_size: usize) -> Result<Self, GrowError> {
        Ok(Self::wrap(Heap::new(initial_size)?))
    }
}

impl<G: HeapGrower> TrackedHeap<G> {
    /// Creates a tracked heap served by `grower`.
    pub fn with_grower(grower: G, initial_size: usize) -> Result<Self, GrowError> {
        Ok(Self::wrap(Heap::with_grower(grower, initial_size)?))
    }

    fn wrap(heap: Heap<G>) -> Self {
        Self {
            heap,
            records: HashMap::new(),
        }
    }

    /// Allocates `size` bytes and records the caller's source location.
    ///
    /// Same contract as [`Heap::allocate`]; only successful allocations
    /// are recorded.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let site = Location::caller();
        let ptr = self.heap.allocate(size)?;

        log::debug!("recorded {size} bytes at {ptr:p}, allocated at {site}");
        self.records.insert(ptr.as_ptr() as usize, Record { size, site });

        Some(ptr)
    }

    /// Releases a recorded allocation.
    ///
    /// The record is consulted first: a pointer this layer never handed
    /// out is rejected without invoking the structural free at all. The
    /// error still distinguishes a re-freed pointer from one that never
    /// belonged to the heap.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;

        if self.records.remove(&addr).is_none() {
            let err = self.heap.classify_unknown(addr);
            log::warn!("rejected release of {addr:#x}: {err}");
            return Err(err);
        }

        self.heap.release(ptr)
    }

    /// Reports every allocation that is still outstanding.
    ///
    /// Zero leaks is the expected terminal state of a correct program.
    pub fn check_leaks(&self) -> LeakReport {
        let mut leaks: Vec<Leak> = self
            .records
            .iter()
            .map(|(&addr, record)| Leak {
                addr,
                size: record.size,
                site: record.site,
            })
            .collect();
        leaks.sort_by_key(|leak| leak.addr);

        LeakReport { leaks }
    }

    /// Read-only heap snapshot, see [`Heap::stats`].
    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Total bytes acquired from the backing store.
    pub fn total_size(&self) -> usize {
        self.heap.total_size()
    }

    /// Bytes currently held by used blocks.
    pub fn used_size(&self) -> usize {
        self.heap.used_size()
    }
}

/// One outstanding allocation listed by [`TrackedHeap::check_leaks`].
#[derive(Debug, Clone, Copy)]
pub struct Leak {
    /// Payload address of the allocation.
    pub addr: usize,
    /// Requested size in bytes.
    pub size: usize,
    /// Source location of the allocating call.
    pub site: &'static Location<'static>,
}

/// Leak listing produced by [`TrackedHeap::check_leaks`].
#[derive(Debug, Clone)]
pub struct LeakReport {
    leaks: Vec<Leak>,
}

impl LeakReport {
    /// Whether every allocation was released.
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Number of outstanding allocations.
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    /// Outstanding allocations, ordered by address.
    pub fn leaks(&self) -> &[Leak] {
        &self.leaks
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.leaks.is_empty() {
            return writeln!(f, "No memory leaks detected");
        }

        writeln!(f, "Memory leaks detected:")?;
        for leak in &self.leaks {
            writeln!(
                f,
                "Leak: {} bytes at {:#x}, allocated at {}",
                leak.size, leak.addr, leak.site
            )?;
        }

        Ok(())
    }
}
