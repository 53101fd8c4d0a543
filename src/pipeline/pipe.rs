//! Hardware pipe interface

use std::sync::Arc;

use super::queue::FrameQueue;
use super::topology::StageId;
use crate::error::Result;
use crate::frame::FrameHandle;

/// A processing backend serving one or more stages
///
/// The driver pushes frames in with [`HardwarePipe::push_frame`]; the pipe
/// processes them on its own threads, marks the stage's destination buffers
/// `Complete` or `Error`, and pushes the frame onto the stage's output queue.
pub trait HardwarePipe: Send + Sync {
    fn push_frame(&self, frame: FrameHandle, stage: StageId) -> Result<()>;

    /// Where finished frames of `stage` are delivered
    fn set_output_queue(&self, queue: Arc<FrameQueue<FrameHandle>>, stage: StageId) -> Result<()>;

    fn start_thread(&self, stage: StageId) -> Result<()>;

    /// Device node backing `stage`, if any
    fn node_index(&self, stage: StageId) -> Option<usize>;

    /// Stop processing threads and hand back frames not yet processed
    fn stop(&self) -> Vec<FrameHandle> {
        Vec::new()
    }
}
