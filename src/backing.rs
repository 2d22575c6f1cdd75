//! Backing-store provider: the "grow the heap" side of the allocator.
//!
//! The heap never talks to the OS directly. It asks a [`HeapGrower`] for
//! more raw memory and carves blocks out of whatever [`Span`] comes back.
//! Growth is requested in coarse chunks (at least [`GROWTH_FLOOR`] bytes,
//! rounded up to the page size) to amortize the syscall overhead.
//!
//! [`PlatformGrower`] is the real implementation. It maps anonymous pages
//! with `mmap` on unix and `VirtualAlloc` on windows. Spans handed out by
//! it are stable for the whole process lifetime: the allocator never
//! unmaps or moves them, so every pointer carved from a span stays valid
//! until process exit.

use std::ptr::NonNull;

use crate::error::GrowError;
use crate::utils::align;

/// Minimum number of bytes requested from the OS per growth.
pub const GROWTH_FLOOR: usize = 4096;

/// One growth's worth of raw memory.
///
/// The span is 100% payload: block metadata lives out of band in the
/// block arena, so nothing inside the span is reserved for headers.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    base: NonNull<u8>,
    size: usize,
}

impl Span {
    /// Creates a span over `size` bytes starting at `base`.
    ///
    /// The caller promises that the region is readable, writable, at
    /// least word-aligned and stays mapped at this address for the rest
    /// of the process lifetime.
    pub fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Base address of the span.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the span in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Abstraction over "request more raw memory from the OS".
///
/// The heap is generic over its grower so tests can inject providers
/// that serve from a fixed budget or fail on demand.
pub trait HeapGrower {
    /// Returns a span of at least `min_bytes` bytes, or an error when the
    /// underlying storage is exhausted. Implementations are free to round
    /// the request up; they must never return a smaller span.
    fn grow(&mut self, min_bytes: usize) -> Result<Span, GrowError>;
}

/// [`HeapGrower`] backed by the OS virtual memory interface.
pub struct PlatformGrower {
    page_size: usize,
}

impl PlatformGrower {
    pub fn new() -> Self {
        Self {
            page_size: sys::page_size(),
        }
    }
}

impl Default for PlatformGrower {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapGrower for PlatformGrower {
    fn grow(&mut self, min_bytes: usize) -> Result<Span, GrowError> {
        let requested = align(min_bytes.max(GROWTH_FLOOR), self.page_size);

        match sys::request_memory(requested) {
            Some(base) => {
                log::debug!("mapped {requested} bytes at {base:p}");
                Ok(Span::new(base, requested))
            }
            None => {
                log::warn!("OS denied a request for {requested} bytes");
                Err(GrowError::Exhausted { requested })
            }
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::os::raw::{c_int, c_void};
    use std::ptr::{self, NonNull};

    use libc::{mmap, off_t, size_t};

    pub(super) fn request_memory(len: usize) -> Option<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = ptr::null_mut::<c_void>();
        // Read-Write only memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        unsafe {
            match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                libc::MAP_FAILED => None,
                addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
            }
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
mod sys {
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    pub(super) fn request_memory(len: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe {
            let addr = Memory::VirtualAlloc(None, len, flags, protection);

            NonNull::new(addr.cast())
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}
