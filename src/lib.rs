pub mod buffer;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod tuning;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::buffer::{AllocationMode, BufferKind, BufferManagerConfig, PlaneSpec};
use crate::frame::Direction;
use crate::pipeline::{
    DriverSettings, DualSettings, SimSettings, Route, StageDescriptor, StageId, StageKind, TopologyConfig,
};

pub use error::{PipelineError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub buffers: Vec<ManagerSpec>,
    pub topology: TopologyConfig,
    pub dual: Option<DualConfig>,
    pub demo: DemoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            buffers: default_buffers(),
            topology: TopologyConfig::default(),
            dual: None,
            demo: DemoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub camera: u32,
    pub queue_timeout_ms: u64,
    /// Longest teardown waits for in-flight frames to drain
    pub stop_timeout_ms: u64,
    pub worker_cores: Vec<usize>,
    pub sim_latency_us: u64,
    /// Mark every n-th frame of a simulated stage as a buffer error
    pub sim_error_every: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "camera0".into(),
            camera: 0,
            queue_timeout_ms: 100,
            stop_timeout_ms: 2000,
            worker_cores: Vec::new(),
            sim_latency_us: 2000,
            sim_error_every: None,
        }
    }
}

impl PipelineConfig {
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            name: self.name.clone(),
            camera: self.camera,
            queue_timeout_ms: self.queue_timeout_ms,
            worker_cores: self.worker_cores.clone(),
        }
    }

    pub fn sim_settings(&self) -> SimSettings {
        SimSettings {
            latency_us: self.sim_latency_us,
            error_every: self.sim_error_every,
            queue_timeout_ms: self.queue_timeout_ms,
            node_base: self.camera as usize * 100,
        }
    }
}

/// One buffer manager and the stage side it serves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSpec {
    pub name: String,
    pub stage: StageId,
    pub direction: Direction,
    /// Serve a single node instead of the whole side
    #[serde(default)]
    pub node: Option<usize>,
    pub config: BufferManagerConfig,
}

impl ManagerSpec {
    pub fn new(name: &str, stage: u32, direction: Direction, config: BufferManagerConfig) -> Self {
        Self {
            name: name.into(),
            stage: StageId(stage),
            direction,
            node: None,
            config,
        }
    }

    pub fn on_node(mut self, node: usize) -> Self {
        self.node = Some(node);
        self
    }
}

/// The second camera of a dual setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DualConfig {
    pub settings: DualSettings,
    pub secondary: SecondaryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub name: String,
    pub camera: u32,
    pub topology: TopologyConfig,
    pub buffers: Vec<ManagerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub requests: u32,
    pub interval_ms: u64,
    /// Every n-th request also asks for a still capture; 0 for never
    pub capture_every: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            requests: 120,
            interval_ms: 33,
            capture_every: 30,
        }
    }
}

fn nv12(width: usize, height: usize) -> Vec<PlaneSpec> {
    vec![
        PlaneSpec::new(width * height, width),
        PlaneSpec::new(width * height / 2, width),
    ]
}

/// Buffer managers matching [`TopologyConfig::default`]
pub fn default_buffers() -> Vec<ManagerSpec> {
    let stream = |count, max| {
        BufferManagerConfig::new(nv12(640, 480), count, max)
            .with_kind(BufferKind::Cached)
            .with_mode(AllocationMode::OnDemand)
    };
    vec![
        ManagerSpec::new(
            "sensor-out",
            0,
            Direction::Dst,
            BufferManagerConfig::new(vec![PlaneSpec::new(640 * 480 * 2, 640 * 2)], 4, 8).with_meta_plane(true),
        ),
        ManagerSpec::new("isp-out", 1, Direction::Dst, stream(4, 8)),
        ManagerSpec::new("preview", 2, Direction::Dst, stream(4, 8)).on_node(0),
        ManagerSpec::new(
            "capture",
            2,
            Direction::Dst,
            stream(1, 3).with_mode(AllocationMode::Silent),
        )
        .on_node(1),
        ManagerSpec::new("recording", 2, Direction::Dst, stream(2, 6)).on_node(2),
        ManagerSpec::new(
            "jpeg-out",
            3,
            Direction::Dst,
            BufferManagerConfig::new(vec![PlaneSpec::new(640 * 480, 0)], 2, 3),
        ),
        ManagerSpec::new("reprocess-out", 4, Direction::Dst, stream(1, 2)),
    ]
}

impl Default for DualConfig {
    /// A two-sensor pair meeting at a sync stage in front of a merge stage
    fn default() -> Self {
        let settings = DualSettings::default();
        let secondary_stages = vec![
            StageDescriptor::new(20, "sensor1", StageKind::Hardware).edge(21, Route::Always, 0, 0),
            StageDescriptor::new(21, "isp1", StageKind::Hardware).edge(settings.sync_stage.0, Route::Always, 0, 0),
            StageDescriptor::new(settings.sync_stage.0, "sync", StageKind::Sync),
        ];
        let stream = BufferManagerConfig::new(nv12(640, 480), 4, 8).with_mode(AllocationMode::OnDemand);
        Self {
            secondary: SecondaryConfig {
                name: "camera1".into(),
                camera: settings.secondary_camera,
                topology: TopologyConfig {
                    entry: StageId(20),
                    reprocess_entry: None,
                    stages: secondary_stages,
                },
                buffers: vec![
                    ManagerSpec::new("sensor1-out", 20, Direction::Dst, stream.clone()),
                    ManagerSpec::new("isp1-out", 21, Direction::Dst, stream),
                ],
            },
            settings,
        }
    }
}

impl DualConfig {
    /// Primary graph matching the default secondary: sensor, ISP, sync,
    /// merge, preview
    pub fn primary_topology(&self) -> TopologyConfig {
        let sync = self.settings.sync_stage.0;
        let merge = self.settings.merge_stage.0;
        TopologyConfig {
            entry: StageId(0),
            reprocess_entry: None,
            stages: vec![
                StageDescriptor::new(0, "sensor0", StageKind::Hardware).edge(1, Route::Always, 0, 0),
                StageDescriptor::new(1, "isp0", StageKind::Hardware).edge(sync, Route::Always, 0, 0),
                StageDescriptor::new(sync, "sync", StageKind::Sync).edge(merge, Route::Always, 0, 0),
                StageDescriptor::new(merge, "merge", StageKind::Merge).edge(10, Route::Preview, 0, 0),
                StageDescriptor::new(10, "preview", StageKind::Sink),
            ],
        }
    }

    pub fn primary_buffers(&self) -> Vec<ManagerSpec> {
        let stream = BufferManagerConfig::new(nv12(640, 480), 4, 8).with_mode(AllocationMode::OnDemand);
        vec![
            ManagerSpec::new("sensor0-out", 0, Direction::Dst, stream.clone()),
            ManagerSpec::new("isp0-out", 1, Direction::Dst, stream.clone()),
            ManagerSpec::new("merge-out", self.settings.merge_stage.0, Direction::Dst, stream),
        ]
    }
}
