//! # fitheap - a best-fit free-list heap allocator
//!
//! This crate implements a growable heap that hands out aligned blocks
//! using a **best-fit** strategy, splits oversized blocks, coalesces
//! adjacent free blocks on release, and optionally tracks the provenance
//! of every allocation for leak and double-free auditing.
//!
//! ## Overview
//!
//! Memory comes from the OS in coarse spans and is carved into blocks:
//!
//! ```text
//!                 Span (one mmap / VirtualAlloc growth)
//! +------------------+------------+------------------------------+
//! |     Block A      |  Block B   |           Block C            |
//! |     (used)       |  (free)    |           (free)             |
//! +------------------+------------+------------------------------+
//!
//!   free list:  B -> C -> ...          used list:  A -> ...
//! ```
//!
//! Block metadata does not live in front of the payload. All records sit
//! in a generation-checked slot arena and the free/used lists thread
//! through it by handle, so list surgery is bounds-checked and a stale
//! handle is detected instead of dereferenced.
//!
//! ## Crate structure
//!
//! ```text
//!   fitheap
//!   ├── backing   - HeapGrower trait, OS span provider
//!   ├── error     - GrowError / ReleaseError
//!   ├── heap      - Heap: allocate / release / stats
//!   └── track     - TrackedHeap: leak and provenance auditing
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use fitheap::TrackedHeap;
//!
//! let mut heap = TrackedHeap::new(1024 * 1024).expect("initial growth failed");
//!
//! let ptr = heap.allocate(40).expect("out of memory");
//! unsafe { ptr.as_ptr().cast::<u32>().write(7) };
//!
//! heap.release(ptr.as_ptr()).unwrap();
//! assert!(heap.check_leaks().is_empty());
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded**: no internal synchronization; wrap the heap in a
//!   lock to share it across threads.
//! - **Advisory safety**: double frees and foreign pointers are detected
//!   and reported, but use-after-free is not prevented.
//! - **Spans are permanent**: memory acquired from the OS is never
//!   returned before process exit, so payload addresses stay stable.

mod arena;
pub mod backing;
mod block;
pub mod error;
pub mod heap;
pub mod track;
mod utils;

pub use backing::{GROWTH_FLOOR, HeapGrower, PlatformGrower, Span};
pub use block::ALIGNMENT;
pub use error::{GrowError, ReleaseError};
pub use heap::{BlockInfo, Heap, HeapStats};
pub use track::{Leak, LeakReport, TrackedHeap};
