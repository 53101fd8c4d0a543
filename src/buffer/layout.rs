//! Buffer manager configuration and plane layout validation

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::slot::{BufferKind, PlaneInfo, MAX_PLANES, META_PLANE_SIZE, VIDEO_MAX_FRAME};
use crate::error::{PipelineError, Result};

/// How a manager materializes slot memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Every requested slot allocated up front, no growth
    AtOnce,
    /// Requested slots up front, one more per starved acquire
    OnDemand,
    /// Requested slots up front, the rest grown by a background thread
    Silent,
}

impl AllocationMode {
    pub fn allows_growth(&self) -> bool {
        !matches!(self, Self::AtOnce)
    }
}

/// Size and stride of one image plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneSpec {
    pub size: usize,
    #[serde(default)]
    pub stride: usize,
}

impl PlaneSpec {
    pub fn new(size: usize, stride: usize) -> Self {
        Self { size, stride }
    }
}

/// Settings for one buffer manager
///
/// # Examples
///
/// ```
/// use framegraph::buffer::{AllocationMode, BufferKind, BufferManagerConfig, PlaneSpec};
///
/// let config = BufferManagerConfig::new(vec![PlaneSpec::new(1920 * 1080, 1920)], 2, 5)
///     .with_mode(AllocationMode::OnDemand)
///     .with_kind(BufferKind::Cached)
///     .with_meta_plane(true);
/// assert_eq!(config.allowed_max_count, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferManagerConfig {
    /// Image planes of one sub-image, meta plane excluded
    pub planes: Vec<PlaneSpec>,
    pub requested_count: usize,
    pub allowed_max_count: usize,
    pub batch_size: usize,
    pub kind: BufferKind,
    pub mode: AllocationMode,
    pub needs_cpu_mapping: bool,
    pub create_meta_plane: bool,
    /// Leading slots allowed to draw from the reserved heap
    pub reserved_count: usize,
    /// Index of the first slot
    pub start_index: usize,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            planes: Vec::new(),
            requested_count: 0,
            allowed_max_count: 0,
            batch_size: 1,
            kind: BufferKind::NonCached,
            mode: AllocationMode::AtOnce,
            needs_cpu_mapping: true,
            create_meta_plane: false,
            reserved_count: 0,
            start_index: 0,
        }
    }
}

impl BufferManagerConfig {
    pub fn new(planes: Vec<PlaneSpec>, requested_count: usize, allowed_max_count: usize) -> Self {
        Self {
            planes,
            requested_count,
            allowed_max_count,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: AllocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_kind(mut self, kind: BufferKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_meta_plane(mut self, enabled: bool) -> Self {
        self.create_meta_plane = enabled;
        self
    }

    pub fn with_cpu_mapping(mut self, enabled: bool) -> Self {
        self.needs_cpu_mapping = enabled;
        self
    }

    pub fn with_reserved_count(mut self, count: usize) -> Self {
        self.reserved_count = count;
        self
    }

    pub fn with_start_index(mut self, index: usize) -> Self {
        self.start_index = index;
        self
    }

    /// Validate and normalize against the manager named `manager`
    ///
    /// An allowed maximum below the requested count is raised to it.
    pub(crate) fn resolve(&self, manager: &str) -> Result<ResolvedLayout> {
        let mut config = self.clone();

        if config.allowed_max_count < config.requested_count {
            warn!(
                manager,
                requested = config.requested_count,
                allowed = config.allowed_max_count,
                "allowed max below requested count, raising"
            );
            config.allowed_max_count = config.requested_count;
        }

        if config.allowed_max_count > VIDEO_MAX_FRAME {
            return Err(PipelineError::invalid_config(format!(
                "{}: allowed max {} exceeds {}",
                manager, config.allowed_max_count, VIDEO_MAX_FRAME
            )));
        }

        if config.planes.is_empty() {
            return Err(PipelineError::invalid_config(format!("{}: empty plane layout", manager)));
        }

        if config.batch_size == 0 {
            return Err(PipelineError::invalid_config(format!("{}: batch size 0", manager)));
        }

        if let Some((i, _)) = config.planes.iter().enumerate().find(|(_, p)| p.size == 0) {
            return Err(PipelineError::invalid_config(format!(
                "{}: plane {} has zero size",
                manager, i
            )));
        }

        let meta = usize::from(config.create_meta_plane);
        let per_image = config.planes.len() + meta;
        if per_image >= MAX_PLANES {
            return Err(PipelineError::invalid_config(format!(
                "{}: {} planes per image",
                manager, per_image
            )));
        }

        let total = config.planes.len() * config.batch_size + meta;
        if total > MAX_PLANES {
            return Err(PipelineError::invalid_config(format!(
                "{}: {} total planes for batch size {}",
                manager, total, config.batch_size
            )));
        }

        debug!(
            manager,
            planes = per_image,
            total,
            batch = config.batch_size,
            "layout resolved"
        );

        Ok(ResolvedLayout {
            config,
            plane_count: per_image,
            total_planes: total,
        })
    }
}

/// A validated configuration with derived plane counts
#[derive(Debug, Clone)]
pub(crate) struct ResolvedLayout {
    pub config: BufferManagerConfig,
    /// Planes per image, meta included
    pub plane_count: usize,
    pub total_planes: usize,
}

impl ResolvedLayout {
    /// Unbacked plane records in slot order: each packed image, then meta
    pub fn plane_template(&self) -> Vec<PlaneInfo> {
        let mut planes = Vec::with_capacity(self.total_planes);
        for _ in 0..self.config.batch_size {
            for spec in &self.config.planes {
                planes.push(PlaneInfo::unbacked(spec.size, spec.stride));
            }
        }
        if self.config.create_meta_plane {
            planes.push(PlaneInfo::unbacked(META_PLANE_SIZE, 0));
        }
        planes
    }

    pub fn image_plane_total(&self) -> usize {
        self.config.planes.len() * self.config.batch_size
    }

    pub fn end_index(&self) -> usize {
        self.config.start_index + self.config.allowed_max_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv() -> Vec<PlaneSpec> {
        vec![PlaneSpec::new(640 * 480, 640), PlaneSpec::new(640 * 240, 640)]
    }

    #[test]
    fn test_allowed_max_raised() {
        let layout = BufferManagerConfig::new(yuv(), 4, 2).resolve("test").unwrap();
        assert_eq!(layout.config.allowed_max_count, 4);
    }

    #[test]
    fn test_rejects_bad_layouts() {
        assert!(BufferManagerConfig::new(vec![], 1, 1).resolve("t").is_err());
        assert!(BufferManagerConfig::new(vec![PlaneSpec::new(0, 0)], 1, 1).resolve("t").is_err());
        assert!(BufferManagerConfig::new(yuv(), 33, 33).resolve("t").is_err());
        assert!(BufferManagerConfig::new(yuv(), 1, 1)
            .with_batch_size(0)
            .resolve("t")
            .is_err());
        assert!(BufferManagerConfig::new(yuv(), 1, 1)
            .with_batch_size(9)
            .resolve("t")
            .is_err());
    }

    #[test]
    fn test_meta_plane_appended_last() {
        let layout = BufferManagerConfig::new(yuv(), 1, 1)
            .with_batch_size(2)
            .with_meta_plane(true)
            .resolve("t")
            .unwrap();
        let planes = layout.plane_template();
        assert_eq!(layout.plane_count, 3);
        assert_eq!(planes.len(), 5);
        assert_eq!(planes[2].size, 640 * 480);
        assert_eq!(planes[4].size, META_PLANE_SIZE);
        assert_eq!(layout.image_plane_total(), 4);
    }
}
