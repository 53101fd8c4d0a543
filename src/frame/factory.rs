//! Building frame records for requests

use std::sync::Arc;

use tracing::trace;

use super::record::{CameraId, FrameRecord, FrameType, OutputSet, SyncType};
use crate::error::{PipelineError, Result};
use crate::pipeline::Topology;

/// What a client asked for
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub request_id: u32,
    pub frame_type: FrameType,
    pub outputs: OutputSet,
    pub sync_type: Option<SyncType>,
    pub timestamp_ns: u64,
}

impl FrameRequest {
    pub fn new(request_id: u32, outputs: OutputSet) -> Self {
        Self {
            request_id,
            frame_type: FrameType::Normal,
            outputs,
            sync_type: None,
            timestamp_ns: 0,
        }
    }

    pub fn with_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    pub fn with_sync(mut self, sync_type: SyncType) -> Self {
        self.sync_type = Some(sync_type);
        self
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }
}

/// Creates the record for a request
///
/// `reference` is an earlier frame whose per-request settings the new
/// frame inherits.
pub trait FrameFactory: Send + Sync {
    fn create(&self, request: &FrameRequest, reference: Option<&FrameRecord>) -> Result<FrameRecord>;
}

/// Gives each frame one entity per stage its outputs route it through
#[derive(Debug, Clone)]
pub struct TopologyFrameFactory {
    topology: Arc<Topology>,
    camera: CameraId,
}

impl TopologyFrameFactory {
    pub fn new(topology: Arc<Topology>, camera: CameraId) -> Self {
        Self { topology, camera }
    }
}

impl FrameFactory for TopologyFrameFactory {
    fn create(&self, request: &FrameRequest, reference: Option<&FrameRecord>) -> Result<FrameRecord> {
        let stages = self
            .topology
            .path_for(request.frame_type, &request.outputs)
            .map_err(|e| PipelineError::FactoryError(e.to_string()))?;
        if stages.is_empty() {
            return Err(PipelineError::FactoryError(format!(
                "request {} routes through no stage",
                request.request_id
            )));
        }

        let frame = FrameRecord::new(request.request_id, request.frame_type, request.outputs, stages);

        let mut metadata = reference.map(|r| r.metadata()).unwrap_or_default();
        metadata.request_id = request.request_id;
        metadata.camera_id = self.camera;
        if request.timestamp_ns != 0 || reference.is_none() {
            metadata.timestamp_ns = request.timestamp_ns;
        }
        frame.set_metadata(metadata);
        frame.set_sync_type(request.sync_type.or_else(|| reference.and_then(|r| r.sync_type())));

        trace!(
            frame = request.request_id,
            camera = self.camera,
            stages = frame.stages().len(),
            "frame built"
        );
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageId, TopologyConfig};

    fn factory() -> TopologyFrameFactory {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();
        TopologyFrameFactory::new(Arc::new(topology), 0)
    }

    #[test]
    fn test_entities_follow_outputs() {
        let frame = factory()
            .create(&FrameRequest::new(5, OutputSet::preview()), None)
            .unwrap();
        assert_eq!(frame.count(), 5);
        assert!(frame.has_entity(StageId(10)));
        assert!(!frame.has_entity(StageId(3)));
    }

    #[test]
    fn test_reference_settings_inherited() {
        let f = factory();
        let first = f
            .create(
                &FrameRequest::new(1, OutputSet::preview())
                    .with_sync(SyncType::Sync)
                    .with_timestamp(42),
                None,
            )
            .unwrap();
        let second = f
            .create(&FrameRequest::new(2, OutputSet::preview()).with_type(FrameType::Internal), Some(&first))
            .unwrap();
        assert_eq!(second.sync_type(), Some(SyncType::Sync));
        assert_eq!(second.metadata().timestamp_ns, 42);
        assert_eq!(second.request_id(), 2);
    }

    #[test]
    fn test_missing_reprocess_entry_fails() {
        let mut config = TopologyConfig::default();
        config.reprocess_entry = None;
        let topology = Topology::from_config(&config).unwrap();
        let f = TopologyFrameFactory::new(Arc::new(topology), 0);
        let err = f
            .create(
                &FrameRequest::new(1, OutputSet::preview()).with_type(FrameType::Reprocessing),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::FactoryError(_)));
    }
}
