//! Frame records, their registries, and how they are created

pub mod factory;
pub mod list;
pub mod record;

pub use factory::{FrameFactory, FrameRequest, TopologyFrameFactory};
pub use list::{FrameList, ListKind};
pub use record::{
    AbortReason, BindingSite, BufferBinding, BufferOwner, CameraId, Direction, Entity,
    EntityBufferState, EntityState, FrameCount, FrameHandle, FrameMetadata, FrameRecord,
    FrameState, FrameType, OutputSet, PendingRelease, SyncType,
};
