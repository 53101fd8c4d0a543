//! DMA allocation backend
//!
//! [`DmaAllocator`] is the primitive the buffer manager consumes to obtain
//! hardware-shareable memory. [`HeapAllocator`] stands in for the kernel
//! heaps: it hands out synthetic descriptors backed by anonymous mappings
//! and enforces a bounded reserved heap.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use memmap2::MmapMut;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Heap an allocation is carved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heap {
    System,
    Reserved,
    Secure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryFlags {
    pub heap: Heap,
    pub cached: bool,
    pub sync_force: bool,
}

impl fmt::Display for MemoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{}{}",
            self.heap,
            if self.cached { "+cached" } else { "" },
            if self.sync_force { "+sync" } else { "" }
        )
    }
}

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("{heap:?} heap exhausted ({requested} bytes requested, {available} available)")]
    OutOfMemory {
        heap: Heap,
        requested: usize,
        available: usize,
    },

    #[error("zero-sized allocation")]
    ZeroSize,

    #[error("mapping failed: {0}")]
    Mapping(#[from] std::io::Error),

    #[error("container rejected: {0}")]
    Container(String),
}

/// One piece of DMA memory: a descriptor and an optional CPU mapping
pub struct DmaAllocation {
    fd: RawFd,
    size: usize,
    flags: MemoryFlags,
    mapping: Option<MmapMut>,
}

impl DmaAllocation {
    pub fn new(fd: RawFd, size: usize, flags: MemoryFlags, mapping: Option<MmapMut>) -> Self {
        Self {
            fd,
            size,
            flags,
            mapping,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    pub fn addr(&self) -> Option<usize> {
        self.mapping.as_ref().map(|m| m.as_ptr() as usize)
    }

    /// Overwrite the mapped bytes; no-op for unmapped memory
    pub fn fill(&mut self, byte: u8) {
        if let Some(mapping) = self.mapping.as_mut() {
            mapping.fill(byte);
        }
    }

    pub fn as_slice(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(|m| &m[..self.size.min(m.len())])
    }
}

impl fmt::Debug for DmaAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaAllocation")
            .field("fd", &self.fd)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("addr", &self.addr())
            .finish()
    }
}

/// Descriptor aliasing the planes of several packed sub-images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub fd: RawFd,
    pub members: Vec<RawFd>,
}

/// Hardware DMA allocator consumed by the pool-backed buffer source
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, size: usize, flags: MemoryFlags, map: bool) -> Result<DmaAllocation, AllocError>;

    fn free(&self, allocation: DmaAllocation);

    fn create_container(&self, fds: &[RawFd], batch_size: usize) -> Result<ContainerHandle, AllocError>;

    fn destroy_container(&self, container: ContainerHandle);
}

#[derive(Default)]
struct Counters {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    failures: AtomicUsize,
    containers_created: AtomicUsize,
    containers_destroyed: AtomicUsize,
}

/// Snapshot of allocator activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocs: usize,
    pub frees: usize,
    pub failures: usize,
    pub containers_created: usize,
    pub containers_destroyed: usize,
    pub live: usize,
    pub reserved_in_use: usize,
}

/// Simulated DMA heap backed by anonymous mappings
///
/// Descriptors are synthetic and never reach the kernel. The reserved and
/// secure heaps share one byte budget; the system heap is unbounded unless
/// a limit is set.
pub struct HeapAllocator {
    next_fd: AtomicI32,
    reserved_capacity: usize,
    reserved_in_use: AtomicUsize,
    system_capacity: Option<usize>,
    system_in_use: AtomicUsize,
    live: Mutex<HashMap<RawFd, usize>>,
    counters: CachePadded<Counters>,
}

impl HeapAllocator {
    const FIRST_FD: RawFd = 1000;

    pub fn new() -> Self {
        Self::with_limits(usize::MAX, None)
    }

    /// Allocator whose reserved heap holds at most `reserved_capacity` bytes
    pub fn with_reserved_capacity(reserved_capacity: usize) -> Self {
        Self::with_limits(reserved_capacity, None)
    }

    pub fn with_limits(reserved_capacity: usize, system_capacity: Option<usize>) -> Self {
        Self {
            next_fd: AtomicI32::new(Self::FIRST_FD),
            reserved_capacity,
            reserved_in_use: AtomicUsize::new(0),
            system_capacity,
            system_in_use: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocs: self.counters.allocs.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            containers_created: self.counters.containers_created.load(Ordering::Relaxed),
            containers_destroyed: self.counters.containers_destroyed.load(Ordering::Relaxed),
            live: self.live.lock().len(),
            reserved_in_use: self.reserved_in_use.load(Ordering::Relaxed),
        }
    }

    fn charge(&self, heap: Heap, bytes: usize) -> Result<(), AllocError> {
        let (budget, capacity) = match heap {
            Heap::Reserved | Heap::Secure => (&self.reserved_in_use, self.reserved_capacity),
            Heap::System => match self.system_capacity {
                Some(cap) => (&self.system_in_use, cap),
                None => {
                    self.system_in_use.fetch_add(bytes, Ordering::Relaxed);
                    return Ok(());
                }
            },
        };

        budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| AllocError::OutOfMemory {
                heap,
                requested: bytes,
                available: capacity.saturating_sub(used),
            })
    }

    fn refund(&self, heap: Heap, bytes: usize) {
        let budget = match heap {
            Heap::Reserved | Heap::Secure => &self.reserved_in_use,
            Heap::System => &self.system_in_use,
        };
        budget.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn next_fd(&self) -> RawFd {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Round a byte count up to whole pages
pub fn page_align(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

impl DmaAllocator for HeapAllocator {
    fn alloc(&self, size: usize, flags: MemoryFlags, map: bool) -> Result<DmaAllocation, AllocError> {
        if size == 0 {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(AllocError::ZeroSize);
        }

        let aligned = page_align(size);
        if let Err(e) = self.charge(flags.heap, aligned) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            debug!(%flags, size, "heap allocation refused: {}", e);
            return Err(e);
        }

        // Secure memory is never CPU visible
        let mapping = if map && flags.heap != Heap::Secure {
            match MmapMut::map_anon(aligned) {
                Ok(m) => Some(m),
                Err(e) => {
                    self.refund(flags.heap, aligned);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(size, "anonymous mapping failed: {}", e);
                    return Err(AllocError::Mapping(e));
                }
            }
        } else {
            None
        };

        let fd = self.next_fd();
        self.live.lock().insert(fd, aligned);
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        trace!(fd, size, %flags, "allocated");

        Ok(DmaAllocation::new(fd, size, flags, mapping))
    }

    fn free(&self, allocation: DmaAllocation) {
        match self.live.lock().remove(&allocation.fd) {
            Some(aligned) => {
                self.refund(allocation.flags.heap, aligned);
                self.counters.frees.fetch_add(1, Ordering::Relaxed);
                trace!(fd = allocation.fd, "freed");
            }
            None => warn!(fd = allocation.fd, "free of unknown descriptor ignored"),
        }
    }

    fn create_container(&self, fds: &[RawFd], batch_size: usize) -> Result<ContainerHandle, AllocError> {
        if fds.len() != batch_size || batch_size < 2 {
            return Err(AllocError::Container(format!(
                "{} members for batch size {}",
                fds.len(),
                batch_size
            )));
        }
        self.counters.containers_created.fetch_add(1, Ordering::Relaxed);
        Ok(ContainerHandle {
            fd: self.next_fd(),
            members: fds.to_vec(),
        })
    }

    fn destroy_container(&self, container: ContainerHandle) {
        self.counters.containers_destroyed.fetch_add(1, Ordering::Relaxed);
        trace!(fd = container.fd, "container destroyed");
    }
}
