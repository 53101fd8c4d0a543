//! In-flight frame records
//!
//! A [`FrameRecord`] tracks one capture request through the stage graph: the
//! frame-level state, one [`Entity`] per stage it must traverse, and the
//! buffers bound to each entity. Buffers are borrowed from their managers;
//! every binding carries its own released flag so a buffer is returned at
//! most once no matter how many error paths race.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::{BufferManager, BufferSlot};
use crate::error::{PipelineError, Result};
use crate::pipeline::{FrameSelector, Route, StageId};

pub type FrameCount = u32;
pub type CameraId = u32;

/// Shared handle to a frame; registries and queues hold clones of it
pub type FrameHandle = Arc<FrameRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Src,
    Dst,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Src => f.write_str("src"),
            Self::Dst => f.write_str("dst"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Normal,
    /// Drives the hardware without producing client output
    Internal,
    Reprocessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    Running,
    Skipped,
    Invalid,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Stage not reached yet
    Pending,
    /// Buffers bound, waiting for the stage
    Requested,
    Processing,
    FrameDone,
    Complete,
    Error,
}

impl EntityState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::FrameDone | Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityBufferState {
    NoReq,
    Requested,
    Complete,
    Error,
}

/// How a dual-camera frame is combined at the merge stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Only the primary stream passes
    Bypass,
    /// Both streams feed the merge stage
    Sync,
    /// Only the secondary stream passes
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    Skipped,
    Invalid,
}

impl From<AbortReason> for FrameState {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Skipped => Self::Skipped,
            AbortReason::Invalid => Self::Invalid,
        }
    }
}

/// Client outputs a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSet {
    pub preview: bool,
    pub capture: bool,
    pub recording: bool,
    pub callback: bool,
}

impl OutputSet {
    pub fn preview() -> Self {
        Self {
            preview: true,
            ..Default::default()
        }
    }

    pub fn preview_and_capture() -> Self {
        Self {
            preview: true,
            capture: true,
            ..Default::default()
        }
    }

    pub fn wants(&self, route: Route) -> bool {
        match route {
            Route::Always => true,
            Route::Preview => self.preview,
            Route::Capture => self.capture,
            Route::Recording => self.recording,
            Route::Callback => self.callback,
        }
    }
}

/// Per-request metadata carried alongside the frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub request_id: u32,
    pub camera_id: CameraId,
    pub timestamp_ns: u64,
    pub meta_frame_count: u32,
    pub zoom_ratio: f32,
}

/// Who a bound buffer must go back to
#[derive(Clone)]
pub enum BufferOwner {
    Manager(Arc<BufferManager>),
    /// Lent across camera graphs; goes back through the selector, which
    /// returns it to `manager`
    Selector {
        camera: CameraId,
        manager: Arc<BufferManager>,
        selector: Arc<dyn FrameSelector>,
    },
}

impl fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manager(m) => write!(f, "Manager({})", m.name()),
            Self::Selector { camera, manager, .. } => write!(f, "Selector(cam{}, {})", camera, manager.name()),
        }
    }
}

/// One buffer bound into a frame
///
/// Dropping a binding without releasing it leaks the slot; the driver only
/// ever moves bindings between entities or drains them through release.
#[derive(Debug)]
pub struct BufferBinding {
    owner: BufferOwner,
    slot: BufferSlot,
    state: EntityBufferState,
    released: bool,
}

impl BufferBinding {
    pub fn new(manager: Arc<BufferManager>, slot: BufferSlot) -> Self {
        Self {
            owner: BufferOwner::Manager(manager),
            slot,
            state: EntityBufferState::Requested,
            released: false,
        }
    }

    /// Route this buffer's release through `selector` on behalf of `camera`
    pub fn through_selector(self, camera: CameraId, selector: Arc<dyn FrameSelector>) -> Self {
        let manager = match self.owner {
            BufferOwner::Manager(manager) | BufferOwner::Selector { manager, .. } => manager,
        };
        Self {
            owner: BufferOwner::Selector {
                camera,
                manager,
                selector,
            },
            slot: self.slot,
            state: self.state,
            released: self.released,
        }
    }

    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn slot(&self) -> &BufferSlot {
        &self.slot
    }

    pub fn owner(&self) -> &BufferOwner {
        &self.owner
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        match &self.owner {
            BufferOwner::Manager(manager) | BufferOwner::Selector { manager, .. } => manager,
        }
    }

    pub fn state(&self) -> EntityBufferState {
        self.state
    }

    pub fn set_state(&mut self, state: EntityBufferState) {
        self.state = state;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the slot to its manager; cancel when the content is bad
    pub fn release(mut self) -> Result<()> {
        self.return_to_owner()
    }

    fn return_to_owner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match &self.owner {
            BufferOwner::Manager(manager) if self.state == EntityBufferState::Error => {
                manager.cancel(self.slot.index)
            }
            BufferOwner::Manager(manager) => manager.release(self.slot.index),
            BufferOwner::Selector {
                camera,
                manager,
                selector,
            } => {
                let mut lent = BufferBinding::new(manager.clone(), self.slot.clone());
                lent.state = self.state;
                selector.release_buffer(*camera, lent)
            }
        }
    }

    /// Detach the release obligation, leaving a released husk behind
    fn take_obligation(&mut self) -> BufferBinding {
        let taken = BufferBinding {
            owner: self.owner.clone(),
            slot: self.slot.clone(),
            state: self.state,
            released: false,
        };
        self.released = true;
        taken
    }
}

/// Where a binding sits in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSite {
    pub stage: StageId,
    pub direction: Direction,
    pub node: usize,
}

/// A binding that has just been marked released and must be returned
#[derive(Debug)]
pub struct PendingRelease {
    pub site: BindingSite,
    pub binding: BufferBinding,
}

impl PendingRelease {
    pub fn complete(self) -> Result<()> {
        self.binding.release()
    }
}

/// Progress of one frame at one stage
#[derive(Debug)]
pub struct Entity {
    pub stage: StageId,
    pub state: EntityState,
    src: Vec<Option<BufferBinding>>,
    dst: Vec<Option<BufferBinding>>,
}

impl Entity {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            state: EntityState::Pending,
            src: Vec::new(),
            dst: Vec::new(),
        }
    }

    fn nodes(&self, direction: Direction) -> &Vec<Option<BufferBinding>> {
        match direction {
            Direction::Src => &self.src,
            Direction::Dst => &self.dst,
        }
    }

    fn nodes_mut(&mut self, direction: Direction) -> &mut Vec<Option<BufferBinding>> {
        match direction {
            Direction::Src => &mut self.src,
            Direction::Dst => &mut self.dst,
        }
    }

    fn live_bindings(&self) -> usize {
        self.src
            .iter()
            .chain(self.dst.iter())
            .flatten()
            .filter(|b| !b.released)
            .count()
    }
}

struct FrameInner {
    state: FrameState,
    sync_type: Option<SyncType>,
    metadata: FrameMetadata,
    entities: BTreeMap<StageId, Entity>,
}

/// One capture request in flight
pub struct FrameRecord {
    count: FrameCount,
    frame_type: FrameType,
    outputs: OutputSet,
    created: Instant,
    inner: Mutex<FrameInner>,
}

impl fmt::Debug for FrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FrameRecord")
            .field("count", &self.count)
            .field("type", &self.frame_type)
            .field("state", &inner.state)
            .field("sync", &inner.sync_type)
            .field("stages", &inner.entities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FrameRecord {
    pub fn new(
        count: FrameCount,
        frame_type: FrameType,
        outputs: OutputSet,
        stages: impl IntoIterator<Item = StageId>,
    ) -> Self {
        let entities = stages.into_iter().map(|s| (s, Entity::new(s))).collect();
        Self {
            count,
            frame_type,
            outputs,
            created: Instant::now(),
            inner: Mutex::new(FrameInner {
                state: FrameState::Running,
                sync_type: None,
                metadata: FrameMetadata {
                    request_id: count,
                    ..Default::default()
                },
                entities,
            }),
        }
    }

    pub fn count(&self) -> FrameCount {
        self.count
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn outputs(&self) -> OutputSet {
        self.outputs
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn state(&self) -> FrameState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == FrameState::Running
    }

    /// Apply a frame-state transition
    ///
    /// Returns false, leaving the state alone, for transitions the state
    /// machine does not allow: nothing leaves `Complete`, and an aborted
    /// frame only moves on to `Complete`.
    pub fn set_state(&self, next: FrameState) -> bool {
        let mut inner = self.inner.lock();
        let allowed = match (inner.state, next) {
            (FrameState::Running, _) => true,
            (FrameState::Skipped | FrameState::Invalid, FrameState::Complete) => true,
            (a, b) => a == b,
        };
        if allowed {
            inner.state = next;
        } else {
            debug!(frame = self.count, from = ?inner.state, to = ?next, "frame state transition refused");
        }
        allowed
    }

    pub fn sync_type(&self) -> Option<SyncType> {
        self.inner.lock().sync_type
    }

    pub fn set_sync_type(&self, sync: Option<SyncType>) {
        self.inner.lock().sync_type = sync;
    }

    pub fn metadata(&self) -> FrameMetadata {
        self.inner.lock().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: FrameMetadata) {
        self.inner.lock().metadata = metadata;
    }

    pub fn request_id(&self) -> u32 {
        self.inner.lock().metadata.request_id
    }

    pub fn stages(&self) -> Vec<StageId> {
        self.inner.lock().entities.keys().copied().collect()
    }

    pub fn has_entity(&self, stage: StageId) -> bool {
        self.inner.lock().entities.contains_key(&stage)
    }

    /// Add an entity for a stage decided after creation
    pub fn ensure_entity(&self, stage: StageId) {
        self.inner
            .lock()
            .entities
            .entry(stage)
            .or_insert_with(|| Entity::new(stage));
    }

    pub fn entity_state(&self, stage: StageId) -> Option<EntityState> {
        self.inner.lock().entities.get(&stage).map(|e| e.state)
    }

    pub fn set_entity_state(&self, stage: StageId, state: EntityState) -> Result<()> {
        let mut inner = self.inner.lock();
        let entity = inner
            .entities
            .get_mut(&stage)
            .ok_or(PipelineError::StageNotFound(stage))?;
        entity.state = state;
        Ok(())
    }

    /// Whether every entity has finished
    pub fn is_done(&self) -> bool {
        self.inner
            .lock()
            .entities
            .values()
            .all(|e| e.state.is_finished())
    }

    /// Bind a buffer at a site
    ///
    /// Refuses to overwrite a live binding, which would leak it; the
    /// rejected binding is handed back so the caller can release it.
    pub fn bind(&self, site: BindingSite, binding: BufferBinding) -> std::result::Result<(), BufferBinding> {
        let mut inner = self.inner.lock();
        let Some(entity) = inner.entities.get_mut(&site.stage) else {
            warn!(frame = self.count, stage = %site.stage, "bind to unknown stage");
            return Err(binding);
        };
        let nodes = entity.nodes_mut(site.direction);
        if nodes.len() <= site.node {
            nodes.resize_with(site.node + 1, || None);
        }
        if matches!(&nodes[site.node], Some(existing) if !existing.released) {
            warn!(frame = self.count, ?site, "site already holds a live buffer");
            return Err(binding);
        }
        nodes[site.node] = Some(binding);
        if entity.state == EntityState::Pending {
            entity.state = EntityState::Requested;
        }
        Ok(())
    }

    /// Descriptor of the live buffer at a site
    pub fn buffer(&self, site: BindingSite) -> Option<BufferSlot> {
        let inner = self.inner.lock();
        inner
            .entities
            .get(&site.stage)
            .and_then(|e| e.nodes(site.direction).get(site.node))
            .and_then(|b| b.as_ref())
            .filter(|b| !b.released)
            .map(|b| b.slot.clone())
    }

    pub fn buffer_state(&self, site: BindingSite) -> EntityBufferState {
        let inner = self.inner.lock();
        inner
            .entities
            .get(&site.stage)
            .and_then(|e| e.nodes(site.direction).get(site.node))
            .and_then(|b| b.as_ref())
            .map(|b| b.state)
            .unwrap_or(EntityBufferState::NoReq)
    }

    pub fn set_buffer_state(&self, site: BindingSite, state: EntityBufferState) -> Result<()> {
        let mut inner = self.inner.lock();
        let binding = inner
            .entities
            .get_mut(&site.stage)
            .and_then(|e| e.nodes_mut(site.direction).get_mut(site.node))
            .and_then(|b| b.as_mut())
            .ok_or_else(|| PipelineError::invalid_state(format!("frame {}: no buffer at {:?}", self.count, site)))?;
        binding.state = state;
        Ok(())
    }

    /// Set the state of every live buffer in one direction of a stage
    pub fn set_stage_buffer_states(&self, stage: StageId, direction: Direction, state: EntityBufferState) {
        let mut inner = self.inner.lock();
        if let Some(entity) = inner.entities.get_mut(&stage) {
            for binding in entity.nodes_mut(direction).iter_mut().flatten() {
                if !binding.released {
                    binding.state = state;
                }
            }
        }
    }

    /// Move the release obligation of a site's buffer out of the frame
    pub fn take_binding(&self, site: BindingSite) -> Option<BufferBinding> {
        let mut inner = self.inner.lock();
        inner
            .entities
            .get_mut(&site.stage)
            .and_then(|e| e.nodes_mut(site.direction).get_mut(site.node))
            .and_then(|b| b.as_mut())
            .filter(|b| !b.released)
            .map(|b| b.take_obligation())
    }

    /// Mark every live buffer of one stage released and hand them out
    pub fn drain_stage(&self, stage: StageId) -> Vec<PendingRelease> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        if let Some(entity) = inner.entities.get_mut(&stage) {
            collect_entity(entity, &mut out);
        }
        out
    }

    /// Mark every live buffer of the frame released and hand them out
    ///
    /// Concurrent callers split the work: each binding is handed out once.
    pub fn drain_all(&self) -> Vec<PendingRelease> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for entity in inner.entities.values_mut() {
            collect_entity(entity, &mut out);
        }
        out
    }

    /// Sites whose buffers the hardware flagged as bad
    pub fn error_sites(&self, stage: StageId) -> Vec<BindingSite> {
        let inner = self.inner.lock();
        let Some(entity) = inner.entities.get(&stage) else {
            return Vec::new();
        };
        [Direction::Src, Direction::Dst]
            .into_iter()
            .flat_map(|direction| {
                entity
                    .nodes(direction)
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| matches!(b, Some(b) if !b.released && b.state == EntityBufferState::Error))
                    .map(move |(node, _)| BindingSite {
                        stage,
                        direction,
                        node,
                    })
            })
            .collect()
    }

    /// Buffers still owed back to their managers
    pub fn live_binding_count(&self) -> usize {
        self.inner
            .lock()
            .entities
            .values()
            .map(|e| e.live_bindings())
            .sum()
    }
}

fn collect_entity(entity: &mut Entity, out: &mut Vec<PendingRelease>) {
    let stage = entity.stage;
    for direction in [Direction::Src, Direction::Dst] {
        for (node, slot) in entity.nodes_mut(direction).iter_mut().enumerate() {
            if let Some(binding) = slot.as_mut().filter(|b| !b.released) {
                out.push(PendingRelease {
                    site: BindingSite {
                        stage,
                        direction,
                        node,
                    },
                    binding: binding.take_obligation(),
                });
            }
        }
    }
}
