//! Buffer pools, fences and their backing memory

pub mod allocator;
pub mod fence;
pub mod layout;
pub mod manager;
pub mod slot;

pub use allocator::{
    page_align, AllocError, AllocatorStats, ContainerHandle, DmaAllocation, DmaAllocator, Heap,
    HeapAllocator, MemoryFlags,
};
pub use fence::{FenceGuard, FENCE_WAIT_TIMEOUT};
pub use layout::{AllocationMode, BufferManagerConfig, PlaneSpec};
pub use manager::{BufferManager, BufferSource, ExternalPlane, ManagerStats, ServiceBuffer};
pub use slot::{
    BufferKind, BufferPermission, BufferPosition, BufferSlot, BufferStatus, PlaneInfo, MAX_PLANES,
    META_PLANE_SIZE, VIDEO_MAX_FRAME,
};
