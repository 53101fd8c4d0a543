//! Frame-graph driver
//!
//! Owns the frame registries, the buffer-manager wiring of every stage, and
//! the dispatch threads that pick finished frames off each stage's output
//! queue. Completing a stage hands its destination buffers to the routed
//! downstream stages, returns what nobody took, and finishes the frame once
//! every entity is done.
//!
//! Lock order: frame registry, then frame record, then buffer manager.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use super::fusion::FusionCoordinator;
use super::pipe::HardwarePipe;
use super::queue::FrameQueue;
use super::topology::{StageId, StageKind, Topology};
use super::worker::{Step, StageWorker, StopFlag, WorkerPool, WorkerSummary};
use crate::buffer::BufferManager;
use crate::error::{PipelineError, Result};
use crate::frame::{
    AbortReason, BindingSite, BufferBinding, CameraId, Direction, EntityState, FrameFactory,
    FrameHandle, FrameList, FrameRecord, FrameRequest, FrameState, FrameType, ListKind,
    PendingRelease, TopologyFrameFactory,
};
use crate::tuning::TuningHooks;

/// Driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub name: String,
    pub camera: CameraId,
    /// Bounded wait of dispatch and sink queues
    pub queue_timeout_ms: u64,
    /// Cores dispatch threads are pinned to, round robin; empty for none
    pub worker_cores: Vec<usize>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: "camera0".into(),
            camera: 0,
            queue_timeout_ms: 100,
            worker_cores: Vec::new(),
        }
    }
}

impl DriverSettings {
    pub fn for_camera(name: &str, camera: CameraId) -> Self {
        Self {
            name: name.into(),
            camera,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ManagerKey {
    stage: StageId,
    direction: Direction,
    node: Option<usize>,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    handoffs: AtomicU64,
    cancelled: AtomicU64,
}

/// Driver counters plus current registry sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub created: u64,
    pub reused: u64,
    pub completed: u64,
    pub aborted: u64,
    pub handoffs: u64,
    pub cancelled_buffers: u64,
    pub in_process: usize,
    pub in_post_process: usize,
}

/// What teardown found and cleaned up
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub aborted: usize,
    pub released_buffers: usize,
    /// Unpaired dual-camera entries dropped at teardown
    pub cleared_pairs: usize,
    pub workers: Vec<(String, WorkerSummary)>,
}

pub struct DriverBuilder {
    settings: DriverSettings,
    topology: Arc<Topology>,
    pipe: Arc<dyn HardwarePipe>,
    factory: Option<Arc<dyn FrameFactory>>,
    tuning: Option<Arc<dyn TuningHooks>>,
    fusion: Option<Arc<FusionCoordinator>>,
}

impl DriverBuilder {
    pub fn settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn FrameFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn tuning(mut self, hooks: Arc<dyn TuningHooks>) -> Self {
        self.tuning = Some(hooks);
        self
    }

    pub fn fusion(mut self, fusion: Arc<FusionCoordinator>) -> Self {
        self.fusion = Some(fusion);
        self
    }

    pub fn build(self) -> Result<Arc<FrameGraphDriver>> {
        let timeout = Duration::from_millis(self.settings.queue_timeout_ms);
        let name = &self.settings.name;

        let done_queues = self
            .topology
            .pipe_stages()
            .map(|stage| {
                let queue = FrameQueue::with_timeout(format!("{}-{}-done", name, stage), timeout);
                (stage, Arc::new(queue))
            })
            .collect();
        let sink_queues = self
            .topology
            .sinks()
            .map(|stage| {
                let queue = FrameQueue::with_timeout(format!("{}-{}-sink", name, stage), timeout);
                (stage, Arc::new(queue))
            })
            .collect();

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(TopologyFrameFactory::new(self.topology.clone(), self.settings.camera))
        });

        let driver = Arc::new(FrameGraphDriver {
            settings: self.settings,
            topology: self.topology,
            factory,
            pipe: self.pipe,
            tuning: self.tuning,
            fusion: self.fusion,
            managers: RwLock::new(HashMap::new()),
            process_list: FrameList::new(ListKind::Process),
            post_process_list: FrameList::new(ListKind::PostProcess),
            done_queues,
            sink_queues,
            stop: StopFlag::new(),
            workers: Mutex::new(WorkerPool::new()),
            started: AtomicBool::new(false),
            counters: CachePadded::new(Counters::default()),
        });

        if let Some(fusion) = &driver.fusion {
            fusion.attach(&driver)?;
        }
        Ok(driver)
    }
}

/// Drives frames through a stage graph
pub struct FrameGraphDriver {
    settings: DriverSettings,
    topology: Arc<Topology>,
    factory: Arc<dyn FrameFactory>,
    pipe: Arc<dyn HardwarePipe>,
    tuning: Option<Arc<dyn TuningHooks>>,
    fusion: Option<Arc<FusionCoordinator>>,
    managers: RwLock<HashMap<ManagerKey, Arc<BufferManager>>>,
    process_list: FrameList,
    post_process_list: FrameList,
    done_queues: HashMap<StageId, Arc<FrameQueue<FrameHandle>>>,
    sink_queues: HashMap<StageId, Arc<FrameQueue<FrameHandle>>>,
    stop: StopFlag,
    workers: Mutex<WorkerPool>,
    started: AtomicBool,
    counters: CachePadded<Counters>,
}

impl fmt::Debug for FrameGraphDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGraphDriver")
            .field("name", &self.settings.name)
            .field("camera", &self.settings.camera)
            .field("process", &self.process_list.len())
            .field("post_process", &self.post_process_list.len())
            .finish()
    }
}

impl FrameGraphDriver {
    pub fn builder(topology: Arc<Topology>, pipe: Arc<dyn HardwarePipe>) -> DriverBuilder {
        DriverBuilder {
            settings: DriverSettings::default(),
            topology,
            pipe,
            factory: None,
            tuning: None,
            fusion: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn camera(&self) -> CameraId {
        self.settings.camera
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn process_list(&self) -> &FrameList {
        &self.process_list
    }

    pub fn post_process_list(&self) -> &FrameList {
        &self.post_process_list
    }

    /// Queue an external consumer pops finished frames of `stage` from
    pub fn sink_queue(&self, stage: StageId) -> Option<Arc<FrameQueue<FrameHandle>>> {
        self.sink_queues.get(&stage).cloned()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_requested()
    }

    /// Wire `manager` to every node of one side of a stage
    pub fn register_manager(&self, stage: StageId, direction: Direction, manager: Arc<BufferManager>) -> Result<()> {
        self.insert_manager(
            ManagerKey {
                stage,
                direction,
                node: None,
            },
            manager,
        )
    }

    /// Wire `manager` to a single node, overriding the stage-wide one
    pub fn register_node_manager(
        &self,
        stage: StageId,
        direction: Direction,
        node: usize,
        manager: Arc<BufferManager>,
    ) -> Result<()> {
        self.insert_manager(
            ManagerKey {
                stage,
                direction,
                node: Some(node),
            },
            manager,
        )
    }

    fn insert_manager(&self, key: ManagerKey, manager: Arc<BufferManager>) -> Result<()> {
        self.topology.stage(key.stage)?;
        debug!(
            driver = %self.settings.name,
            stage = %key.stage,
            direction = %key.direction,
            node = ?key.node,
            manager = manager.name(),
            "manager registered"
        );
        if let Some(old) = self.managers.write().insert(key, manager) {
            warn!(manager = old.name(), "replaced buffer manager");
        }
        Ok(())
    }

    pub fn manager_for(&self, stage: StageId, direction: Direction, node: usize) -> Result<Arc<BufferManager>> {
        let managers = self.managers.read();
        managers
            .get(&ManagerKey {
                stage,
                direction,
                node: Some(node),
            })
            .or_else(|| {
                managers.get(&ManagerKey {
                    stage,
                    direction,
                    node: None,
                })
            })
            .cloned()
            .ok_or(PipelineError::BufferManagerMissing { stage, direction })
    }

    fn has_manager(&self, stage: StageId, direction: Direction, node: usize) -> bool {
        self.manager_for(stage, direction, node).is_ok()
    }

    /// Spawn a dispatch thread per pipe stage and start the pipe
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cores = &self.settings.worker_cores;
        for (i, (stage, queue)) in self.done_queues.iter().enumerate() {
            let stage = *stage;
            self.pipe.set_output_queue(queue.clone(), stage)?;

            let driver: Weak<Self> = Arc::downgrade(self);
            let core = (!cores.is_empty()).then(|| cores[i % cores.len()]);
            let worker = StageWorker::spawn(
                format!("{}-dispatch-{}", self.settings.name, stage),
                queue.clone(),
                self.stop.clone(),
                core,
                move |frame: FrameHandle| {
                    let Some(driver) = driver.upgrade() else {
                        return Ok(Step::Exit);
                    };
                    driver.complete_stage(&frame, stage)?;
                    Ok(Step::Continue)
                },
            )?;
            self.workers.lock().add(worker);
            self.pipe.start_thread(stage)?;
        }
        info!(driver = %self.settings.name, stages = self.done_queues.len(), "driver started");
        Ok(())
    }

    /// Look up or create the frame for `request`
    ///
    /// A request id already registered in either registry returns the
    /// existing frame; the factory is not called again.
    #[instrument(skip_all, fields(driver = %self.settings.name, request = request.request_id))]
    pub fn create_frame(&self, request: &FrameRequest, reference: Option<&FrameRecord>) -> Result<FrameHandle> {
        self.create_or_get(request, reference).map(|(frame, _)| frame)
    }

    fn create_or_get(&self, request: &FrameRequest, reference: Option<&FrameRecord>) -> Result<(FrameHandle, bool)> {
        if self.stop.is_requested() {
            return Err(PipelineError::Stopped);
        }
        let (list, other) = match request.frame_type {
            FrameType::Reprocessing => (&self.post_process_list, &self.process_list),
            FrameType::Normal | FrameType::Internal => (&self.process_list, &self.post_process_list),
        };
        if let Some(existing) = other.find(request.request_id) {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok((existing, false));
        }

        let (frame, created) = list.get_or_try_insert_with(request.request_id, || {
            self.factory.create(request, reference).map(Arc::new)
        })?;

        if created {
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            counter!("framegraph_frames_created_total", "driver" => self.settings.name.clone()).increment(1);
            if let Some(hooks) = &self.tuning {
                hooks.on_frame_created(&frame);
            }
            trace!(frame = frame.count(), list = %list.kind(), "frame created");
        } else {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(frame = frame.count(), "request already in flight");
        }
        Ok((frame, created))
    }

    /// Create a frame for `request` and push it into its entry stage
    pub fn submit(&self, request: &FrameRequest) -> Result<FrameHandle> {
        let (frame, created) = self.create_or_get(request, None)?;
        if created {
            self.start_frame(&frame)?;
        }
        Ok(frame)
    }

    /// Bind the entry stage's buffers and push the frame to it
    pub fn start_frame(&self, frame: &FrameHandle) -> Result<()> {
        let entry = self.topology.entry_for(frame.frame_type())?;
        self.prepare_stage(frame, entry)?;
        self.push_or_abort(frame, entry)
    }

    /// Acquire a slot from the manager wired to a site, unbound
    pub fn acquire_binding(&self, stage: StageId, direction: Direction, node: usize) -> Result<BufferBinding> {
        let manager = self.manager_for(stage, direction, node)?;
        let slot = manager.acquire(None)?;
        Ok(BufferBinding::new(manager, slot))
    }

    /// Attach a buffer to one node of a stage
    ///
    /// Without `buffer` a slot is acquired from the manager wired to the
    /// site. Any failure aborts the frame and returns its buffers.
    pub fn bind_buffer(
        &self,
        stage: StageId,
        frame: &FrameHandle,
        direction: Direction,
        node: Option<usize>,
        buffer: Option<BufferBinding>,
    ) -> Result<()> {
        let node = node.unwrap_or(0);
        let binding = match buffer {
            Some(binding) => binding,
            None => match self.acquire_binding(stage, direction, node) {
                Ok(binding) => binding,
                Err(e) => {
                    warn!(frame = frame.count(), stage = %stage, %direction, node, "bind failed: {}", e);
                    self.abort_frame(frame, AbortReason::Invalid);
                    return Err(e);
                }
            },
        };

        let site = BindingSite {
            stage,
            direction,
            node,
        };
        if let Err(rejected) = frame.bind(site, binding) {
            if let Err(e) = rejected.release() {
                error!(frame = frame.count(), "could not return rejected buffer: {}", e);
            }
            self.abort_frame(frame, AbortReason::Invalid);
            return Err(PipelineError::invalid_state(format!(
                "frame {}: cannot bind {:?}",
                frame.count(),
                site
            )));
        }
        trace!(frame = frame.count(), ?site, "buffer bound");
        Ok(())
    }

    /// Bind the destination buffers `stage` writes for this frame
    ///
    /// Routed output nodes must have a manager. A stage with no downstream
    /// edges binds whichever of its nodes have one.
    pub fn prepare_stage(&self, frame: &FrameHandle, stage: StageId) -> Result<()> {
        let desc = self.topology.stage(stage)?;
        if !desc.kind.runs_on_pipe() {
            return Ok(());
        }

        let src = BindingSite {
            stage,
            direction: Direction::Src,
            node: 0,
        };
        if frame.buffer(src).is_none() && self.has_manager(stage, Direction::Src, 0) {
            self.bind_buffer(stage, frame, Direction::Src, Some(0), None)?;
        }

        if desc.downstream.is_empty() {
            for node in 0..desc.dst_nodes {
                if self.has_manager(stage, Direction::Dst, node) {
                    self.bind_buffer(stage, frame, Direction::Dst, Some(node), None)?;
                }
            }
        } else {
            for edge in self.topology.routed_edges(stage, &frame.outputs())? {
                self.bind_buffer(stage, frame, Direction::Dst, Some(edge.from_node), None)?;
            }
        }
        Ok(())
    }

    /// Push a frame into a stage's input
    ///
    /// Frames entering a post-process stage move to the post-process
    /// registry first. Failures leave the frame to the caller.
    pub fn push_to_stage(&self, frame: &FrameHandle, stage: StageId) -> Result<()> {
        if self.stop.is_requested() {
            return Err(PipelineError::Stopped);
        }
        let desc = self.topology.stage(stage)?;
        match desc.kind {
            StageKind::Hardware | StageKind::Merge => {
                if desc.post_process && self.process_list.transfer(&self.post_process_list, frame.count())? {
                    trace!(frame = frame.count(), stage = %stage, "moved to post-process");
                }
                self.pipe.push_frame(frame.clone(), stage)?;
            }
            StageKind::Sink => {
                let queue = self
                    .sink_queues
                    .get(&stage)
                    .ok_or(PipelineError::StageNotFound(stage))?;
                frame.set_entity_state(stage, EntityState::Processing)?;
                queue.push(frame.clone())?;
            }
            StageKind::Sync => {
                return Err(PipelineError::invalid_state(format!(
                    "sync stage {} is fed by frame fusion",
                    stage
                )));
            }
        }
        if let Some(hooks) = &self.tuning {
            hooks.on_stage_pushed(frame, stage);
        }
        Ok(())
    }

    fn push_or_abort(&self, frame: &FrameHandle, stage: StageId) -> Result<()> {
        if let Err(e) = self.push_to_stage(frame, stage) {
            warn!(frame = frame.count(), stage = %stage, "push failed: {}", e);
            self.abort_frame(frame, AbortReason::Invalid);
            return Err(e);
        }
        Ok(())
    }

    /// A stage finished with a frame
    ///
    /// Bad buffers are cancelled and the branches they fed are marked
    /// failed. Good destination buffers move to the routed downstream
    /// stages; whatever the stage still holds is returned before those
    /// stages are prepared and pushed. The frame finishes once every entity
    /// is done.
    #[instrument(skip_all, fields(driver = %self.settings.name, frame = frame.count(), stage = %stage))]
    pub fn complete_stage(&self, frame: &FrameHandle, stage: StageId) -> Result<()> {
        if !frame.is_running() {
            let reason = match frame.state() {
                FrameState::Skipped => AbortReason::Skipped,
                _ => AbortReason::Invalid,
            };
            self.abort_frame(frame, reason);
            return Ok(());
        }
        self.topology.stage(stage)?;

        for site in frame.error_sites(stage) {
            if let Some(bad) = frame.take_binding(site) {
                debug!(?site, "cancelling bad buffer");
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = bad.release() {
                    error!(?site, "cancel failed: {}", e);
                }
            }
        }

        frame.set_entity_state(stage, EntityState::Complete)?;
        if let Some(hooks) = &self.tuning {
            hooks.on_stage_done(frame, stage);
        }

        let fusion = self.fusion.as_ref();
        if let Some(fusion) = fusion.filter(|f| f.merge_stage() == stage) {
            fusion.finish_after_merge(frame)?;
        }

        let mut next = Vec::new();
        let mut offer_to_fusion = false;
        for edge in self.topology.routed_edges(stage, &frame.outputs())? {
            if self.topology.stage(edge.to)?.kind == StageKind::Sync {
                let Some(fusion) = fusion else {
                    self.abort_frame(frame, AbortReason::Invalid);
                    return Err(PipelineError::invalid_config(format!(
                        "stage {} feeds sync stage {} without frame fusion",
                        stage, edge.to
                    )));
                };
                fusion.prepare_before_sync(self, frame, stage, edge)?;
                offer_to_fusion = true;
                continue;
            }

            let from = BindingSite {
                stage,
                direction: Direction::Dst,
                node: edge.from_node,
            };
            let Some(binding) = frame.take_binding(from) else {
                debug!(to = %edge.to, "no buffer for branch, failing it");
                self.fail_branch(frame, edge.to);
                continue;
            };
            self.bind_buffer(edge.to, frame, Direction::Src, Some(edge.to_node), Some(binding))?;
            self.counters.handoffs.fetch_add(1, Ordering::Relaxed);
            next.push(edge.to);
        }

        for pending in frame.drain_stage(stage) {
            release_pending(pending);
        }

        for to in next {
            self.prepare_stage(frame, to)?;
            self.push_or_abort(frame, to)?;
        }

        if offer_to_fusion {
            if let Some(fusion) = fusion {
                fusion.offer(self, frame)?;
            }
        }

        if frame.is_done() {
            self.finish_frame(frame);
        }
        Ok(())
    }

    /// Mark a branch the frame can no longer take as failed
    fn fail_branch(&self, frame: &FrameHandle, from: StageId) {
        let mut stack = vec![from];
        while let Some(stage) = stack.pop() {
            if frame.entity_state(stage) != Some(EntityState::Pending) {
                continue;
            }
            if let Err(e) = frame.set_entity_state(stage, EntityState::Error) {
                debug!(stage = %stage, "failing branch stage: {}", e);
            }
            if let Ok(edges) = self.topology.routed_edges(stage, &frame.outputs()) {
                stack.extend(edges.iter().map(|e| e.to));
            }
        }
    }

    /// Finish a frame whose entities are all done
    ///
    /// Returns whatever the frame still holds and removes it from its
    /// registry. A dual-camera frame that finishes without pairing, because
    /// its branch into sync failed, is reported to fusion. Safe to call more
    /// than once.
    pub fn finish_frame(&self, frame: &FrameHandle) {
        frame.set_state(FrameState::Complete);
        let removed = self.deregister_releasing(frame);
        for pending in frame.drain_all() {
            release_pending(pending);
        }
        if removed {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            counter!("framegraph_frames_completed_total", "driver" => self.settings.name.clone()).increment(1);
            if let Some(hooks) = &self.tuning {
                hooks.on_frame_finished(frame, FrameState::Complete);
            }
            debug!(frame = frame.count(), age = ?frame.age(), "frame complete");
            if let Some(fusion) = &self.fusion {
                fusion.forget(self, frame);
            }
        }
    }

    /// Abort a frame, returning every buffer it holds exactly once
    ///
    /// Buffers go back under the registry lock before the frame is removed.
    /// Aborting an already aborted or finished frame releases nothing. A
    /// dual-camera frame aborted before pairing is reported to fusion so its
    /// partner does not wait for it. Returns how many buffers this call
    /// released.
    pub fn abort_frame(&self, frame: &FrameHandle, reason: AbortReason) -> usize {
        self.abort_inner(frame, reason).1
    }

    fn abort_inner(&self, frame: &FrameHandle, reason: AbortReason) -> (bool, usize) {
        let target: FrameState = reason.into();
        frame.set_state(target);

        let mut released = 0;
        let removed = self.deregister_with(frame, |f| {
            for pending in f.drain_all() {
                released += 1;
                release_pending(pending);
            }
        });
        for pending in frame.drain_all() {
            released += 1;
            release_pending(pending);
        }

        let final_state = frame.state();
        frame.set_state(FrameState::Complete);

        if removed {
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            counter!("framegraph_frames_aborted_total", "driver" => self.settings.name.clone()).increment(1);
            if let Some(hooks) = &self.tuning {
                hooks.on_frame_finished(frame, final_state);
            }
            debug!(frame = frame.count(), ?reason, released, "frame aborted");
            if let Some(fusion) = &self.fusion {
                fusion.forget(self, frame);
            }
        }
        (removed, released)
    }

    fn deregister_releasing(&self, frame: &FrameHandle) -> bool {
        self.deregister_with(frame, |f| {
            for pending in f.drain_all() {
                release_pending(pending);
            }
        })
    }

    fn deregister_with<F>(&self, frame: &FrameHandle, before_remove: F) -> bool
    where
        F: FnMut(&FrameHandle),
    {
        let mut before_remove = before_remove;
        self.process_list.remove_with(frame, &mut before_remove)
            || self.post_process_list.remove_with(frame, &mut before_remove)
    }

    pub fn find_frame(&self, count: u32) -> Option<FrameHandle> {
        self.process_list
            .find(count)
            .or_else(|| self.post_process_list.find(count))
    }

    /// Stop everything and return every outstanding buffer
    ///
    /// Queues are released so blocked threads wake, threads are joined,
    /// then every registered or queued frame is aborted.
    pub fn teardown(&self) -> TeardownReport {
        info!(driver = %self.settings.name, "teardown");
        self.stop.request();
        for queue in self.done_queues.values().chain(self.sink_queues.values()) {
            queue.release();
        }

        let mut stranded = self.pipe.stop();
        let workers = self.workers.lock().join_all();
        for queue in self.done_queues.values().chain(self.sink_queues.values()) {
            stranded.extend(queue.drain());
        }

        let mut report = TeardownReport {
            workers,
            ..Default::default()
        };
        let registered = self
            .process_list
            .frames()
            .into_iter()
            .chain(self.post_process_list.frames());
        for frame in registered.chain(stranded) {
            let (removed, released) = self.abort_inner(&frame, AbortReason::Invalid);
            report.aborted += usize::from(removed);
            report.released_buffers += released;
        }
        if let Some(fusion) = &self.fusion {
            report.cleared_pairs = fusion.clear_pending();
        }

        info!(
            driver = %self.settings.name,
            aborted = report.aborted,
            released = report.released_buffers,
            "teardown complete"
        );
        report
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            handoffs: self.counters.handoffs.load(Ordering::Relaxed),
            cancelled_buffers: self.counters.cancelled.load(Ordering::Relaxed),
            in_process: self.process_list.len(),
            in_post_process: self.post_process_list.len(),
        }
    }
}

fn release_pending(pending: PendingRelease) {
    let site = pending.site;
    if let Err(e) = pending.complete() {
        error!(?site, "buffer release failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManagerConfig, HeapAllocator, PlaneSpec};
    use crate::frame::OutputSet;
    use crate::pipeline::sim::{SimSettings, SimulatedPipe};
    use crate::pipeline::{Route, StageDescriptor};

    fn linear() -> Arc<Topology> {
        let stages = vec![
            StageDescriptor::new(0, "sensor", StageKind::Hardware).edge(1, Route::Always, 0, 0),
            StageDescriptor::new(1, "isp", StageKind::Hardware).edge(2, Route::Always, 0, 0),
            StageDescriptor::new(2, "out", StageKind::Sink),
        ];
        Arc::new(Topology::new(stages, StageId(0), None).unwrap())
    }

    fn manager(name: &str, count: usize) -> Arc<BufferManager> {
        let m = BufferManager::with_pool(name, Arc::new(HeapAllocator::new()));
        m.configure(&BufferManagerConfig::new(vec![PlaneSpec::new(1024, 32)], count, count))
            .unwrap();
        m.allocate().unwrap();
        m
    }

    fn driver(topology: Arc<Topology>) -> Arc<FrameGraphDriver> {
        let pipe = Arc::new(SimulatedPipe::new(
            topology.pipe_stages(),
            SimSettings {
                latency_us: 0,
                ..Default::default()
            },
        ));
        FrameGraphDriver::builder(topology, pipe).build().unwrap()
    }

    #[test]
    fn test_create_frame_is_idempotent() {
        let d = driver(linear());
        let req = FrameRequest::new(9, OutputSet::preview());
        let a = d.create_frame(&req, None).unwrap();
        let b = d.create_frame(&req, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(d.stats().created, 1);
        assert_eq!(d.stats().reused, 1);
    }

    #[test]
    fn test_bind_without_manager_aborts() {
        let d = driver(linear());
        let frame = d.create_frame(&FrameRequest::new(1, OutputSet::preview()), None).unwrap();
        let err = d
            .bind_buffer(StageId(0), &frame, Direction::Dst, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BufferManagerMissing {
                stage: StageId(0),
                direction: Direction::Dst
            }
        ));
        assert_eq!(frame.state(), FrameState::Complete);
        assert!(d.process_list().is_empty());
    }

    #[test]
    fn test_exhausted_bind_returns_earlier_buffers() {
        let d = driver(linear());
        let sensor = manager("sensor", 2);
        let isp = manager("isp", 1);
        d.register_manager(StageId(0), Direction::Dst, sensor.clone()).unwrap();
        d.register_manager(StageId(1), Direction::Dst, isp.clone()).unwrap();
        let _held = isp.acquire(None).unwrap();

        let frame = d.create_frame(&FrameRequest::new(1, OutputSet::preview()), None).unwrap();
        d.prepare_stage(&frame, StageId(0)).unwrap();
        assert_eq!(sensor.available_count(), 1);

        let err = d.prepare_stage(&frame, StageId(1)).unwrap_err();
        assert!(matches!(err, PipelineError::Exhausted(_)));
        assert_eq!(sensor.available_count(), 2);
        assert_eq!(frame.live_binding_count(), 0);
    }

    #[test]
    fn test_abort_twice_releases_once() {
        let d = driver(linear());
        let sensor = manager("sensor", 2);
        d.register_manager(StageId(0), Direction::Dst, sensor.clone()).unwrap();
        let frame = d.create_frame(&FrameRequest::new(1, OutputSet::preview()), None).unwrap();
        d.prepare_stage(&frame, StageId(0)).unwrap();

        assert_eq!(d.abort_frame(&frame, AbortReason::Skipped), 1);
        assert_eq!(d.abort_frame(&frame, AbortReason::Invalid), 0);
        assert_eq!(sensor.stats().released, 1);
        assert_eq!(d.stats().aborted, 1);
    }

    #[test]
    fn test_frame_flows_to_sink_and_finishes() {
        let d = driver(linear());
        let sensor = manager("sensor", 2);
        let isp = manager("isp", 2);
        d.register_manager(StageId(0), Direction::Dst, sensor.clone()).unwrap();
        d.register_manager(StageId(1), Direction::Dst, isp.clone()).unwrap();
        d.start().unwrap();

        let frame = d.submit(&FrameRequest::new(1, OutputSet::preview())).unwrap();
        let sink = d.sink_queue(StageId(2)).unwrap();
        let out = sink.wait_and_pop_for(Duration::from_secs(2)).unwrap();
        assert!(Arc::ptr_eq(&frame, &out));
        assert_eq!(sensor.available_count(), 2);
        assert_eq!(isp.available_count(), 1);

        d.complete_stage(&out, StageId(2)).unwrap();
        assert_eq!(out.state(), FrameState::Complete);
        assert_eq!(isp.available_count(), 2);
        assert_eq!(d.stats().completed, 1);

        let report = d.teardown();
        assert_eq!(report.aborted, 0);
    }

    #[test]
    fn test_teardown_returns_everything() {
        let d = driver(linear());
        let sensor = manager("sensor", 4);
        d.register_manager(StageId(0), Direction::Dst, sensor.clone()).unwrap();
        for id in 0..3 {
            let frame = d.create_frame(&FrameRequest::new(id, OutputSet::preview()), None).unwrap();
            d.prepare_stage(&frame, StageId(0)).unwrap();
        }
        assert_eq!(sensor.available_count(), 1);

        let report = d.teardown();
        assert_eq!(report.aborted, 3);
        assert_eq!(sensor.available_count(), 4);
        assert!(matches!(
            d.create_frame(&FrameRequest::new(7, OutputSet::preview()), None),
            Err(PipelineError::Stopped)
        ));
    }
}
