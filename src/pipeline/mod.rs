//! Stage graph, queues, worker threads and the frame-graph driver

pub mod driver;
pub mod fusion;
pub mod pipe;
pub mod queue;
pub mod sim;
pub mod topology;
pub mod worker;

pub use driver::{DriverBuilder, DriverSettings, DriverStats, FrameGraphDriver, TeardownReport};
pub use fusion::{
    AfterSync, CameraRole, DualSettings, FrameSelector, FusionCoordinator, FusionStats,
    ManagerReturningSelector, OUTPUT_SLOT, PRIMARY_SLOT, SECONDARY_SLOT,
};
pub use pipe::HardwarePipe;
pub use queue::{FrameQueue, QueueStats};
pub use sim::{SimSettings, SimulatedPipe};
pub use topology::{Edge, Route, StageDescriptor, StageId, StageKind, Topology, TopologyConfig};
pub use worker::{StageWorker, Step, StopFlag, TimeoutThrottle, WorkerPool, WorkerSummary};
