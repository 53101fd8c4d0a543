//! Optional observer hooks for 3A and tuning collaborators

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::frame::{FrameRecord, FrameState};
use crate::pipeline::StageId;

/// Callbacks the driver makes as frames move through the graph
///
/// Every method defaults to doing nothing; a driver built without hooks
/// simply skips them.
pub trait TuningHooks: Send + Sync {
    fn on_frame_created(&self, _frame: &FrameRecord) {}

    fn on_stage_pushed(&self, _frame: &FrameRecord, _stage: StageId) {}

    fn on_stage_done(&self, _frame: &FrameRecord, _stage: StageId) {}

    fn on_frame_finished(&self, _frame: &FrameRecord, _state: FrameState) {}
}

/// Traces every hook and counts finished frames
#[derive(Debug, Default)]
pub struct TracingHooks {
    finished: AtomicU64,
    aborted: AtomicU64,
}

impl TracingHooks {
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

impl TuningHooks for TracingHooks {
    fn on_frame_created(&self, frame: &FrameRecord) {
        trace!(frame = frame.count(), "tuning: created");
    }

    fn on_stage_done(&self, frame: &FrameRecord, stage: StageId) {
        trace!(frame = frame.count(), stage = %stage, "tuning: stage done");
    }

    fn on_frame_finished(&self, frame: &FrameRecord, state: FrameState) {
        match state {
            FrameState::Skipped | FrameState::Invalid => self.aborted.fetch_add(1, Ordering::Relaxed),
            FrameState::Running | FrameState::Complete => self.finished.fetch_add(1, Ordering::Relaxed),
        };
        trace!(frame = frame.count(), ?state, age = ?frame.age(), "tuning: finished");
    }
}
