//! Error types for buffer and frame-graph operations
//!
//! Buffer-level and frame-level failures are recoverable at the pool or frame
//! granularity; configuration defects are not.

use std::time::Duration;

use thiserror::Error;

use crate::frame::Direction;
use crate::pipeline::StageId;

/// Errors raised by buffer managers, frame registries and the graph driver
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed plane layout or count bounds at configure time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The allocation backend could not produce backing memory
    #[error("Allocation failed for {manager}: {reason}")]
    AllocationFailure { manager: String, reason: String },

    /// No buffer available and growth not permitted
    #[error("No buffer available in {0}")]
    Exhausted(String),

    /// Resize rejected because the pool is at its bound
    #[error("{manager}: resize rejected (allocated {allocated}, bound {bound})")]
    LimitExceeded {
        manager: String,
        allocated: usize,
        bound: usize,
    },

    /// Resize rejected because the candidate slot is held
    #[error("{manager}: buffer {index} is in use")]
    InUse { manager: String, index: usize },

    /// Operation not offered by this buffer source
    #[error("{manager}: {operation} is not supported by this buffer source")]
    Unsupported {
        manager: String,
        operation: &'static str,
    },

    /// No buffer manager wired to the stage/direction pair
    #[error("No buffer manager registered for stage {stage} ({direction})")]
    BufferManagerMissing { stage: StageId, direction: Direction },

    /// The frame factory could not build a frame
    #[error("Frame factory failed: {0}")]
    FactoryError(String),

    /// Index outside the slots this manager owns
    #[error("{manager}: buffer index {index} out of range")]
    InvalidIndex { manager: String, index: usize },

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Fence was not signalled in time
    #[error("Fence wait timed out after {0:?}")]
    FenceTimeout(Duration),

    /// Fence could not be waited on
    #[error("Fence error: {0}")]
    Fence(String),

    /// The queue was released while waiting or pushing
    #[error("Queue {0} released")]
    QueueReleased(String),

    /// Bounded wait elapsed without data
    #[error("Timed out waiting on {0}")]
    Timeout(String),

    /// Stop was requested; no further work is accepted
    #[error("Pipeline stopped")]
    Stopped,

    /// Stage id not present in the topology
    #[error("Stage {0} not found")]
    StageNotFound(StageId),

    /// Frame not present in the registry it was looked up in
    #[error("Frame {0} not found")]
    FrameNotFound(u32),

    /// Hardware pipe rejected a request
    #[error("Pipe error on stage {stage}: {reason}")]
    Pipe { stage: StageId, reason: String },

    /// Configuration file could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for framegraph operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn allocation(manager: &str, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            manager: manager.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn pipe(stage: StageId, reason: impl Into<String>) -> Self {
        Self::Pipe {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the caller can recover at frame or pool granularity
    ///
    /// Structural defects (missing wiring, bad config, factory failures)
    /// are not retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfig(_)
                | Self::BufferManagerMissing { .. }
                | Self::FactoryError(_)
                | Self::StageNotFound(_)
                | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Exhausted("isp-out".into());
        assert_eq!(err.to_string(), "No buffer available in isp-out");

        let err = PipelineError::BufferManagerMissing {
            stage: StageId(3),
            direction: Direction::Dst,
        };
        assert_eq!(
            err.to_string(),
            "No buffer manager registered for stage 3 (dst)"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(PipelineError::Exhausted("a".into()).is_recoverable());
        assert!(PipelineError::InUse {
            manager: "a".into(),
            index: 1
        }
        .is_recoverable());
        assert!(!PipelineError::invalid_config("empty layout").is_recoverable());
        assert!(!PipelineError::FactoryError("x".into()).is_recoverable());
    }
}
