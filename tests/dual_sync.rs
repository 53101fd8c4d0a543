//! Dual-camera fusion: pairing at the sync stage and input release per sync type

use std::sync::Arc;

use framegraph::buffer::{BufferManager, BufferManagerConfig, HeapAllocator, PlaneSpec};
use framegraph::frame::{
    AbortReason, BindingSite, BufferBinding, CameraId, Direction, EntityBufferState, EntityState, FrameHandle,
    FrameRequest, FrameState, OutputSet, SyncType,
};
use framegraph::pipeline::{
    DriverSettings, FrameGraphDriver, FrameQueue, FrameSelector, FusionCoordinator, HardwarePipe, StageId,
    Topology,
};
use framegraph::{DualConfig, PipelineError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Default)]
struct CountingPipe {
    pushes: Mutex<Vec<StageId>>,
}

impl CountingPipe {
    fn pushes_to(&self, stage: StageId) -> usize {
        self.pushes.lock().iter().filter(|s| **s == stage).count()
    }
}

impl HardwarePipe for CountingPipe {
    fn push_frame(&self, _frame: FrameHandle, stage: StageId) -> Result<()> {
        self.pushes.lock().push(stage);
        Ok(())
    }

    fn set_output_queue(&self, _queue: Arc<FrameQueue<FrameHandle>>, _stage: StageId) -> Result<()> {
        Ok(())
    }

    fn start_thread(&self, _stage: StageId) -> Result<()> {
        Ok(())
    }

    fn node_index(&self, _stage: StageId) -> Option<usize> {
        None
    }
}

/// Returns buffers to their manager and remembers which camera they came from
#[derive(Default)]
struct CountingSelector {
    released: Mutex<Vec<CameraId>>,
}

impl CountingSelector {
    fn count(&self, camera: CameraId) -> usize {
        self.released.lock().iter().filter(|c| **c == camera).count()
    }

    fn total(&self) -> usize {
        self.released.lock().len()
    }
}

impl FrameSelector for CountingSelector {
    fn release_buffer(&self, camera: CameraId, buffer: BufferBinding) -> Result<()> {
        self.released.lock().push(camera);
        buffer.release()
    }
}

struct Rig {
    fusion: Arc<FusionCoordinator>,
    selector: Arc<CountingSelector>,
    primary: Arc<FrameGraphDriver>,
    secondary: Arc<FrameGraphDriver>,
    primary_pipe: Arc<CountingPipe>,
    managers: Vec<Arc<BufferManager>>,
}

const MERGE: StageId = StageId(6);
const PREVIEW: StageId = StageId(10);

fn pool(name: &str) -> Arc<BufferManager> {
    let manager = BufferManager::with_pool(name, Arc::new(HeapAllocator::new()));
    manager
        .configure(&BufferManagerConfig::new(vec![PlaneSpec::new(2048, 64)], 2, 2))
        .unwrap();
    manager.allocate().unwrap();
    manager
}

fn rig() -> Rig {
    let dual = DualConfig::default();
    let selector = Arc::new(CountingSelector::default());
    let fusion = Arc::new(FusionCoordinator::new(dual.settings.clone(), selector.clone()));

    let primary_pipe = Arc::new(CountingPipe::default());
    let primary = FrameGraphDriver::builder(
        Arc::new(Topology::from_config(&dual.primary_topology()).unwrap()),
        primary_pipe.clone(),
    )
    .settings(DriverSettings::for_camera("cam0", 0))
    .fusion(fusion.clone())
    .build()
    .unwrap();

    let secondary = FrameGraphDriver::builder(
        Arc::new(Topology::from_config(&dual.secondary.topology).unwrap()),
        Arc::new(CountingPipe::default()),
    )
    .settings(DriverSettings::for_camera("cam1", 1))
    .fusion(fusion.clone())
    .build()
    .unwrap();

    let mut managers = Vec::new();
    for (driver, stage) in [
        (&primary, 0),
        (&primary, 1),
        (&primary, MERGE.0),
        (&secondary, 20),
        (&secondary, 21),
    ] {
        let manager = pool(&format!("{}-{}", driver.name(), stage));
        driver
            .register_manager(StageId(stage), Direction::Dst, manager.clone())
            .unwrap();
        managers.push(manager);
    }

    Rig {
        fusion,
        selector,
        primary,
        secondary,
        primary_pipe,
        managers,
    }
}

impl Rig {
    fn submit(&self, id: u32, sync: SyncType) -> (FrameHandle, FrameHandle) {
        let request = FrameRequest::new(id, OutputSet::preview()).with_sync(sync);
        (
            self.primary.submit(&request).unwrap(),
            self.secondary.submit(&request).unwrap(),
        )
    }

    fn run_primary(&self, frame: &FrameHandle) {
        for stage in [0, 1] {
            self.primary.complete_stage(frame, StageId(stage)).unwrap();
        }
    }

    fn run_secondary(&self, frame: &FrameHandle) {
        for stage in [20, 21] {
            self.secondary.complete_stage(frame, StageId(stage)).unwrap();
        }
    }

    fn deliver_preview(&self, frame: &FrameHandle) {
        let delivered = self.primary.sink_queue(PREVIEW).unwrap().pop().unwrap();
        assert!(Arc::ptr_eq(&delivered, frame));
        self.primary.complete_stage(&delivered, PREVIEW).unwrap();
    }

    fn assert_balanced(&self) {
        assert!(self.primary.process_list().is_empty());
        assert!(self.secondary.process_list().is_empty());
        for manager in &self.managers {
            let stats = manager.stats();
            assert_eq!(stats.held, 0, "{} still holds buffers", manager.name());
            assert_eq!(stats.available, stats.allocated, "{}", manager.name());
        }
    }
}

#[test]
fn bypass_relabels_primary_and_returns_it_once() {
    let rig = rig();
    let (primary, secondary) = rig.submit(1, SyncType::Bypass);

    rig.run_primary(&primary);
    assert_eq!(rig.selector.total(), 0);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 0);
    assert_eq!(primary.entity_state(MERGE), Some(EntityState::Complete));

    rig.run_secondary(&secondary);
    assert_eq!(secondary.state(), FrameState::Complete);
    assert_eq!(rig.secondary.stats().aborted, 1);

    rig.deliver_preview(&primary);
    assert_eq!(primary.state(), FrameState::Complete);
    assert_eq!(rig.selector.count(0), 1);
    assert_eq!(rig.selector.total(), 1);
    assert_eq!(rig.fusion.stats().relabels, 1);
    rig.assert_balanced();
}

#[test]
fn switch_relabels_secondary_and_returns_it_once() {
    let rig = rig();
    let (primary, secondary) = rig.submit(2, SyncType::Switch);

    rig.run_primary(&primary);
    assert_eq!(rig.fusion.stats().pending, 1);
    assert_eq!(rig.selector.total(), 0);

    rig.run_secondary(&secondary);
    assert_eq!(rig.selector.total(), 0);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 0);
    assert_eq!(secondary.state(), FrameState::Complete);
    assert_eq!(rig.secondary.stats().completed, 1);

    rig.deliver_preview(&primary);
    assert_eq!(rig.selector.count(1), 1);
    assert_eq!(rig.selector.total(), 1);
    rig.assert_balanced();
}

#[test]
fn sync_merges_once_and_returns_both_inputs() {
    let rig = rig();
    let (primary, secondary) = rig.submit(3, SyncType::Sync);

    rig.run_primary(&primary);
    rig.run_secondary(&secondary);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 1);
    assert_eq!(rig.selector.total(), 0);
    assert_eq!(rig.fusion.stats().merges, 1);

    rig.primary.complete_stage(&primary, MERGE).unwrap();
    assert_eq!(rig.selector.count(0), 1);
    assert_eq!(rig.selector.count(1), 1);

    rig.deliver_preview(&primary);
    assert_eq!(rig.selector.total(), 2);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 1);
    rig.assert_balanced();
}

#[test]
fn pairing_works_with_either_camera_first() {
    let rig = rig();

    let (primary, secondary) = rig.submit(10, SyncType::Sync);
    rig.run_secondary(&secondary);
    assert_eq!(rig.fusion.stats().pending, 1);
    rig.run_primary(&primary);
    assert_eq!(rig.fusion.stats().pending, 0);
    rig.primary.complete_stage(&primary, MERGE).unwrap();
    rig.deliver_preview(&primary);

    let (primary, secondary) = rig.submit(11, SyncType::Sync);
    rig.run_primary(&primary);
    rig.run_secondary(&secondary);
    rig.primary.complete_stage(&primary, MERGE).unwrap();
    rig.deliver_preview(&primary);

    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 2);
    assert_eq!(rig.selector.total(), 4);
    assert_eq!(rig.primary.stats().completed, 2);
    assert_eq!(rig.secondary.stats().completed, 2);
    rig.assert_balanced();
}

#[test]
fn dropped_partner_takes_the_pair_down() {
    let rig = rig();
    let (primary, secondary) = rig.submit(4, SyncType::Sync);
    rig.run_primary(&primary);

    secondary.set_state(FrameState::Skipped);
    rig.fusion.offer(&rig.secondary, &secondary).unwrap();

    assert_eq!(primary.state(), FrameState::Complete);
    assert_eq!(secondary.state(), FrameState::Complete);
    assert_eq!(rig.primary.stats().aborted, 1);
    assert_eq!(rig.secondary.stats().aborted, 1);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 0);
    assert_eq!(rig.selector.total(), 0);
    assert_eq!(rig.fusion.stats().dropped, 1);
    rig.assert_balanced();
}

#[test]
fn relabeled_buffer_stays_held_while_the_sink_reads_it() {
    let rig = rig();
    let (primary, secondary) = rig.submit(5, SyncType::Bypass);
    rig.run_primary(&primary);

    let sink = rig.primary.sink_queue(PREVIEW).unwrap();
    let delivered = sink.pop().unwrap();
    let held = delivered
        .buffer(BindingSite {
            stage: PREVIEW,
            direction: Direction::Src,
            node: 0,
        })
        .unwrap()
        .index;

    // The ISP pool lent the relabeled buffer; nobody else may get it yet
    let isp = &rig.managers[1];
    assert_eq!(isp.stats().held, 1);
    let other = isp.acquire(None).unwrap();
    assert_ne!(other.index, held);
    assert!(matches!(isp.acquire(None), Err(PipelineError::Exhausted(_))));
    isp.release(other.index).unwrap();
    assert_eq!(rig.selector.total(), 0);

    rig.primary.complete_stage(&delivered, PREVIEW).unwrap();
    assert_eq!(rig.selector.count(0), 1);
    assert_eq!(rig.selector.total(), 1);
    assert_eq!(isp.stats().held, 0);

    rig.run_secondary(&secondary);
    rig.assert_balanced();
}

#[test]
fn partner_aborted_before_sync_releases_the_waiting_frame() {
    let rig = rig();
    let (primary, secondary) = rig.submit(6, SyncType::Sync);
    rig.run_primary(&primary);
    assert_eq!(rig.fusion.stats().pending, 1);

    rig.secondary.abort_frame(&secondary, AbortReason::Invalid);

    assert_eq!(rig.fusion.stats().pending, 0);
    assert_eq!(rig.fusion.stats().dropped, 1);
    assert_eq!(primary.state(), FrameState::Complete);
    assert_eq!(rig.primary.stats().aborted, 1);
    assert_eq!(rig.secondary.stats().aborted, 1);
    assert_eq!(rig.primary_pipe.pushes_to(MERGE), 0);
    assert_eq!(rig.selector.total(), 0);
    rig.assert_balanced();
}

#[test]
fn frame_aborted_first_drops_its_partner_on_arrival() {
    let rig = rig();
    let (primary, secondary) = rig.submit(7, SyncType::Switch);

    rig.secondary.abort_frame(&secondary, AbortReason::Skipped);
    assert_eq!(rig.fusion.stats().pending, 1);

    rig.run_primary(&primary);
    assert_eq!(rig.fusion.stats().pending, 0);
    assert_eq!(rig.fusion.stats().dropped, 1);
    assert_eq!(rig.primary.stats().aborted, 1);
    assert_eq!(rig.selector.total(), 0);
    rig.assert_balanced();
}

#[test]
fn failed_branch_into_sync_drops_the_waiting_partner() {
    let rig = rig();
    let (primary, secondary) = rig.submit(8, SyncType::Sync);
    rig.run_primary(&primary);

    let sensor_out = BindingSite {
        stage: StageId(20),
        direction: Direction::Dst,
        node: 0,
    };
    secondary.set_buffer_state(sensor_out, EntityBufferState::Error).unwrap();
    rig.secondary.complete_stage(&secondary, StageId(20)).unwrap();

    assert_eq!(rig.secondary.stats().completed, 1);
    assert_eq!(rig.secondary.stats().cancelled_buffers, 1);
    assert_eq!(rig.primary.stats().aborted, 1);
    assert_eq!(rig.fusion.stats().pending, 0);
    assert_eq!(rig.fusion.stats().dropped, 1);
    rig.assert_balanced();
}

#[test]
fn teardown_clears_unpaired_entries() {
    let rig = rig();
    let (primary, _secondary) = rig.submit(9, SyncType::Sync);
    rig.run_primary(&primary);
    assert_eq!(rig.fusion.stats().pending, 1);

    let report = rig.primary.teardown();
    assert_eq!(report.aborted, 1);
    assert_eq!(report.cleared_pairs, 1);
    assert_eq!(rig.fusion.stats().pending, 0);

    let report = rig.secondary.teardown();
    assert_eq!(report.aborted, 1);
    assert_eq!(rig.fusion.stats().pending, 0);
    rig.assert_balanced();
}

/// Run one stage, sometimes aborting the frame first or failing its output
fn step_with_faults(rng: &mut StdRng, driver: &FrameGraphDriver, frame: &FrameHandle, stage: StageId) {
    if !frame.is_running() {
        return;
    }
    if rng.gen_bool(0.05) {
        driver.abort_frame(frame, AbortReason::Invalid);
        return;
    }
    if rng.gen_bool(0.15) {
        let site = BindingSite {
            stage,
            direction: Direction::Dst,
            node: 0,
        };
        frame.set_buffer_state(site, EntityBufferState::Error).unwrap();
    }
    // Failure paths abort the frame themselves
    if let Err(e) = driver.complete_stage(frame, stage) {
        assert!(!frame.is_running(), "stage {} failed but frame still runs: {}", stage, e);
    }
}

#[test]
fn seeded_faults_on_either_camera_never_leak() {
    let mut rng = StdRng::seed_from_u64(0xf05e);
    let rig = rig();
    let sync_types = [SyncType::Bypass, SyncType::Switch, SyncType::Sync];
    let requests = 300;

    for id in 0..requests {
        let sync = sync_types[rng.gen_range(0..sync_types.len())];
        let (primary, secondary) = rig.submit(id, sync);
        let merges = rig.primary_pipe.pushes_to(MERGE);

        // Interleave the cameras, keeping each one's stage order
        let mut primary_stages = vec![0, 1];
        let mut secondary_stages = vec![20, 21];
        primary_stages.reverse();
        secondary_stages.reverse();
        while !primary_stages.is_empty() || !secondary_stages.is_empty() {
            let take_primary = secondary_stages.is_empty() || (!primary_stages.is_empty() && rng.gen_bool(0.5));
            if take_primary {
                let stage = primary_stages.pop().unwrap();
                step_with_faults(&mut rng, &rig.primary, &primary, StageId(stage));
            } else {
                let stage = secondary_stages.pop().unwrap();
                step_with_faults(&mut rng, &rig.secondary, &secondary, StageId(stage));
            }
        }

        if rig.primary_pipe.pushes_to(MERGE) > merges {
            step_with_faults(&mut rng, &rig.primary, &primary, MERGE);
        }
        let sink = rig.primary.sink_queue(PREVIEW).unwrap();
        while let Some(delivered) = sink.pop() {
            rig.primary.complete_stage(&delivered, PREVIEW).unwrap();
        }

        assert_eq!(rig.fusion.stats().pending, 0, "request {} ({:?}) left unpaired", id, sync);
        assert!(!primary.is_running(), "request {}", id);
        assert!(!secondary.is_running(), "request {}", id);
    }

    let primary_stats = rig.primary.stats();
    let secondary_stats = rig.secondary.stats();
    assert_eq!(primary_stats.completed + primary_stats.aborted, requests as u64);
    assert_eq!(secondary_stats.completed + secondary_stats.aborted, requests as u64);
    assert!(rig.fusion.stats().dropped > 0);
    assert!(primary_stats.cancelled_buffers + secondary_stats.cancelled_buffers > 0);
    rig.assert_balanced();
}

#[test]
fn primary_driver_needs_the_merge_stage() {
    let dual = DualConfig::default();
    let fusion = Arc::new(FusionCoordinator::new(
        dual.settings.clone(),
        Arc::new(CountingSelector::default()),
    ));
    let err = FrameGraphDriver::builder(
        Arc::new(Topology::from_config(&dual.secondary.topology).unwrap()),
        Arc::new(CountingPipe::default()),
    )
    .settings(DriverSettings::for_camera("cam0", 0))
    .fusion(fusion)
    .build()
    .unwrap_err();
    assert!(matches!(err, PipelineError::StageNotFound(MERGE)));
}
