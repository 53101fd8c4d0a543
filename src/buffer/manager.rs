//! Buffer manager
//!
//! A [`BufferManager`] owns a fixed-capacity arena of [`BufferSlot`]s for one
//! purpose and mediates every acquire/release so that at most one stage holds
//! a slot at a time.
//!
//! Two locks are involved and always taken in the same order:
//! - `sizing` guards the configuration and allocation bookkeeping; growth,
//!   shrink, allocate, reset and deinit serialize on it.
//! - `pool` guards the slot arena and the availability queue; acquire and
//!   release only ever touch this one, and only for a short critical section.
//!
//! Backing memory is allocated and freed outside the `pool` lock.

use std::collections::VecDeque;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use super::allocator::{ContainerHandle, DmaAllocation, DmaAllocator};
use super::fence::{FenceGuard, FENCE_WAIT_TIMEOUT};
use super::layout::{AllocationMode, BufferManagerConfig, ResolvedLayout};
use super::slot::{BufferKind, BufferPermission, BufferPosition, BufferSlot, BufferStatus, PlaneInfo, META_PLANE_SIZE};
use crate::error::{PipelineError, Result};

/// Attempts against the reserved heap before falling back
const RESERVED_ALLOC_RETRIES: u32 = 3;
const RESERVED_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// One plane handed over by the service together with its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalPlane {
    pub fd: RawFd,
    pub addr: Option<usize>,
    pub size: usize,
    pub stride: usize,
}

/// A buffer owned by the service and lent to the pipeline
#[derive(Debug)]
pub struct ServiceBuffer {
    /// Image planes in slot order, meta plane excluded
    pub planes: Vec<ExternalPlane>,
    pub fence: FenceGuard,
}

impl ServiceBuffer {
    pub fn new(planes: Vec<ExternalPlane>) -> Self {
        Self {
            planes,
            fence: FenceGuard::none(),
        }
    }

    pub fn with_fence(mut self, fence: FenceGuard) -> Self {
        self.fence = fence;
        self
    }
}

/// Where slot memory comes from
pub enum BufferSource {
    /// Memory allocated and owned by the manager
    Pool { allocator: Arc<dyn DmaAllocator> },
    /// Image memory supplied per buffer by the service; the allocator, if
    /// any, backs meta planes and batch containers
    ServiceSupplied {
        allocator: Option<Arc<dyn DmaAllocator>>,
        fence_timeout: Duration,
    },
}

impl BufferSource {
    pub fn pool(allocator: Arc<dyn DmaAllocator>) -> Self {
        Self::Pool { allocator }
    }

    pub fn service(allocator: Option<Arc<dyn DmaAllocator>>) -> Self {
        Self::ServiceSupplied {
            allocator,
            fence_timeout: FENCE_WAIT_TIMEOUT,
        }
    }

    fn allocator(&self) -> Option<&Arc<dyn DmaAllocator>> {
        match self {
            Self::Pool { allocator } => Some(allocator),
            Self::ServiceSupplied { allocator, .. } => allocator.as_ref(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Pool { .. } => "pool",
            Self::ServiceSupplied { .. } => "service",
        }
    }
}

/// Memory attached to one slot, freed as a unit
#[derive(Default)]
struct SlotMemory {
    planes: Vec<DmaAllocation>,
    meta: Option<DmaAllocation>,
    containers: Vec<ContainerHandle>,
}

impl SlotMemory {
    fn is_empty(&self) -> bool {
        self.planes.is_empty() && self.meta.is_none() && self.containers.is_empty()
    }
}

struct SlotEntry {
    record: BufferSlot,
    memory: SlotMemory,
    service: Option<ServiceBuffer>,
    needs_revalidation: bool,
}

impl SlotEntry {
    fn is_backed(&self, source: &BufferSource) -> bool {
        match source {
            BufferSource::Pool { .. } => !self.memory.planes.is_empty(),
            BufferSource::ServiceSupplied { .. } => self.service.is_some(),
        }
    }
}

struct PoolState {
    slots: Vec<SlotEntry>,
    available: VecDeque<usize>,
    allocated: usize,
    active: bool,
    start: usize,
    mode: AllocationMode,
}

impl PoolState {
    fn empty() -> Self {
        Self {
            slots: Vec::new(),
            available: VecDeque::new(),
            allocated: 0,
            active: false,
            start: 0,
            mode: AllocationMode::AtOnce,
        }
    }

    fn position(&self, index: usize) -> Option<usize> {
        index
            .checked_sub(self.start)
            .filter(|pos| *pos < self.slots.len())
    }

    fn remove_available(&mut self, index: usize) -> bool {
        match self.available.iter().position(|i| *i == index) {
            Some(at) => {
                self.available.remove(at);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Sizing {
    layout: Option<ResolvedLayout>,
    skip_allocation: bool,
    reserved_exhausted: bool,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    cancelled: AtomicU64,
    grown: AtomicU64,
    allocs: AtomicU64,
}

/// Snapshot of a manager's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub allocated: usize,
    pub available: usize,
    pub held: usize,
    pub allowed_max: usize,
    pub acquired: u64,
    pub released: u64,
    pub cancelled: u64,
    pub grown: u64,
    pub backend_allocs: u64,
}

/// Owner of one named pool of hardware buffers
pub struct BufferManager {
    name: String,
    source: BufferSource,
    sizing: Mutex<Sizing>,
    pool: Mutex<PoolState>,
    grow_thread: Mutex<Option<JoinHandle<()>>>,
    grow_cancel: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("name", &self.name)
            .field("source", &self.source.label())
            .finish()
    }
}

impl BufferManager {
    pub fn new(name: impl Into<String>, source: BufferSource) -> Self {
        Self {
            name: name.into(),
            source,
            sizing: Mutex::new(Sizing::default()),
            pool: Mutex::new(PoolState::empty()),
            grow_thread: Mutex::new(None),
            grow_cancel: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Pool-backed manager drawing from `allocator`
    pub fn with_pool(name: impl Into<String>, allocator: Arc<dyn DmaAllocator>) -> Arc<Self> {
        Arc::new(Self::new(name, BufferSource::pool(allocator)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &BufferSource {
        &self.source
    }

    pub fn is_service_supplied(&self) -> bool {
        matches!(self.source, BufferSource::ServiceSupplied { .. })
    }

    /// Apply a configuration; only allowed while nothing is allocated
    #[instrument(skip(self, config), fields(manager = %self.name))]
    pub fn configure(&self, config: &BufferManagerConfig) -> Result<()> {
        let layout = config.resolve(&self.name)?;
        let mut sizing = self.sizing.lock();
        let mut pool = self.pool.lock();

        if pool.active || pool.allocated > 0 {
            return Err(PipelineError::invalid_state(format!(
                "{}: configure while {} slots allocated",
                self.name, pool.allocated
            )));
        }

        let cfg = &layout.config;
        let template = layout.plane_template();
        pool.slots = (cfg.start_index..layout.end_index())
            .map(|index| {
                let mut record = BufferSlot::new(index, cfg.kind, cfg.batch_size);
                record.planes = template.clone();
                record.plane_count = layout.plane_count;
                record.has_meta_plane = cfg.create_meta_plane;
                SlotEntry {
                    record,
                    memory: SlotMemory::default(),
                    service: None,
                    needs_revalidation: false,
                }
            })
            .collect();
        pool.available.clear();
        pool.start = cfg.start_index;
        pool.mode = cfg.mode;

        info!(
            requested = cfg.requested_count,
            allowed = cfg.allowed_max_count,
            batch = cfg.batch_size,
            kind = %cfg.kind,
            mode = ?cfg.mode,
            source = self.source.label(),
            "configured"
        );

        sizing.layout = Some(layout);
        sizing.skip_allocation = false;
        sizing.reserved_exhausted = false;
        Ok(())
    }

    /// Materialize memory for the requested slots
    ///
    /// After [`reset`](Self::reset) this only re-activates the pool.
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn allocate(self: &Arc<Self>) -> Result<()> {
        let mut sizing = self.sizing.lock();
        let layout = sizing
            .layout
            .clone()
            .ok_or_else(|| PipelineError::invalid_state(format!("{}: not configured", self.name)))?;

        if sizing.skip_allocation {
            sizing.skip_allocation = false;
            let allocated = {
                let mut pool = self.pool.lock();
                pool.active = true;
                pool.allocated
            };
            info!(allocated, "allocation skipped, reusing retained slots");
            // Growth interrupted by reset picks up where it stopped
            if self.grows_silently(&layout, allocated) {
                drop(sizing);
                self.spawn_grow_thread()?;
            }
            return Ok(());
        }

        {
            let pool = self.pool.lock();
            if pool.active {
                return Err(PipelineError::invalid_state(format!(
                    "{}: already allocated",
                    self.name
                )));
            }
        }

        let cfg = &layout.config;
        match &self.source {
            BufferSource::Pool { .. } => {
                let mut batch: Vec<(usize, SlotMemory)> = Vec::with_capacity(cfg.requested_count);
                for index in cfg.start_index..cfg.start_index + cfg.requested_count {
                    match self.allocate_slot(&mut sizing, &layout, index) {
                        Ok(memory) => batch.push((index, memory)),
                        Err(e) => {
                            error!(index, "allocation failed, rolling back {} slots: {}", batch.len(), e);
                            for (_, memory) in batch {
                                self.free_memory(memory);
                            }
                            return Err(e);
                        }
                    }
                }

                let mut pool = self.pool.lock();
                for (index, memory) in batch {
                    self.install(&mut pool, index, memory, None);
                }
                pool.active = true;
            }
            BufferSource::ServiceSupplied { .. } => {
                let mut batch: Vec<(usize, DmaAllocation)> = Vec::new();
                if cfg.create_meta_plane {
                    for index in cfg.start_index..layout.end_index() {
                        match self.allocate_meta() {
                            Ok(meta) => batch.push((index, meta)),
                            Err(e) => {
                                error!(index, "meta plane allocation failed: {}", e);
                                for (_, meta) in batch {
                                    self.free_memory(SlotMemory {
                                        meta: Some(meta),
                                        ..Default::default()
                                    });
                                }
                                return Err(e);
                            }
                        }
                    }
                }

                let mut pool = self.pool.lock();
                for (index, meta) in batch {
                    if let Some(pos) = pool.position(index) {
                        let entry = &mut pool.slots[pos];
                        if let Some(plane) = entry.record.planes.last_mut() {
                            plane.fd = Some(meta.fd());
                            plane.addr = meta.addr();
                        }
                        entry.memory.meta = Some(meta);
                    }
                }
                pool.active = true;
            }
        }

        info!(count = cfg.requested_count, "allocated");

        if self.grows_silently(&layout, cfg.requested_count) {
            drop(sizing);
            self.spawn_grow_thread()?;
        }
        Ok(())
    }

    fn grows_silently(&self, layout: &ResolvedLayout, allocated: usize) -> bool {
        layout.config.mode == AllocationMode::Silent
            && layout.config.allowed_max_count > allocated
            && !self.is_service_supplied()
    }

    /// Hand out a slot, preferring `hint` when it is available
    ///
    /// Never waits for a slot to come back; a starved pool either grows by
    /// one (on-demand and silent modes) or fails with `Exhausted`.
    pub fn acquire(&self, hint: Option<usize>) -> Result<BufferSlot> {
        self.acquire_at(hint, BufferPosition::InHal)
    }

    pub fn acquire_at(&self, hint: Option<usize>, position: BufferPosition) -> Result<BufferSlot> {
        if let Some((slot, fence)) = self.take_available(hint, position)? {
            return self.finish_acquire(slot, fence);
        }

        let mode = self.pool.lock().mode;
        if !mode.allows_growth() || self.is_service_supplied() {
            debug!(manager = %self.name, "no buffer available");
            return Err(PipelineError::Exhausted(self.name.clone()));
        }

        let mut sizing = self.sizing.lock();
        match self.grow_locked(&mut sizing, 1, Some(position)) {
            Ok((_, Some(slot))) => {
                info!(manager = %self.name, index = slot.index, "grew pool for starved acquire");
                self.note_acquired();
                Ok(slot)
            }
            Ok((_, None)) | Err(PipelineError::LimitExceeded { .. }) => {
                debug!(manager = %self.name, "no buffer available and pool at bound");
                Err(PipelineError::Exhausted(self.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Return a held slot to the availability queue
    ///
    /// Releasing a slot that is already available is a logged no-op.
    pub fn release(&self, index: usize) -> Result<()> {
        self.put_back(index, false)
    }

    /// Return a slot whose content is invalid
    ///
    /// The slot is re-validated before it is next handed out.
    pub fn cancel(&self, index: usize) -> Result<()> {
        self.put_back(index, true)
    }

    /// Grow the pool by up to `count` slots
    ///
    /// Clamps to the remaining headroom with a warning; fails with
    /// `LimitExceeded` only when there is no headroom at all.
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn grow(&self, count: usize) -> Result<usize> {
        if self.is_service_supplied() {
            return Err(PipelineError::Unsupported {
                manager: self.name.clone(),
                operation: "grow",
            });
        }
        let mut sizing = self.sizing.lock();
        self.grow_locked(&mut sizing, count, None).map(|(grown, _)| grown)
    }

    /// Free the highest allocated slot beyond the requested count
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn shrink(&self) -> Result<()> {
        if self.is_service_supplied() {
            return Err(PipelineError::Unsupported {
                manager: self.name.clone(),
                operation: "shrink",
            });
        }

        let sizing = self.sizing.lock();
        let layout = sizing
            .layout
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state(format!("{}: not configured", self.name)))?;
        let requested = layout.config.requested_count;

        let memory = {
            let mut pool = self.pool.lock();
            if pool.allocated <= requested {
                warn!(allocated = pool.allocated, requested, "shrink below requested count rejected");
                return Err(PipelineError::LimitExceeded {
                    manager: self.name.clone(),
                    allocated: pool.allocated,
                    bound: requested,
                });
            }

            let index = pool.start + pool.allocated - 1;
            let pos = pool.allocated - 1;
            if pool.slots[pos].record.status.permission != BufferPermission::Available {
                warn!(index, "shrink candidate still held");
                return Err(PipelineError::InUse {
                    manager: self.name.clone(),
                    index,
                });
            }

            pool.remove_available(index);
            pool.allocated -= 1;
            let entry = &mut pool.slots[pos];
            entry.record.status = BufferStatus::default();
            clear_plane_backing(&mut entry.record);
            entry.record.containers.clear();
            std::mem::take(&mut entry.memory)
        };

        self.free_memory(memory);
        info!("shrank by one slot");
        Ok(())
    }

    /// Release every outstanding slot and retain memory for the next session
    ///
    /// The following [`allocate`](Self::allocate) re-activates the retained
    /// slots without touching the backend.
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn reset(&self) {
        self.stop_grow_thread();

        let mut sizing = self.sizing.lock();
        let mut pool = self.pool.lock();
        let mut available = VecDeque::new();
        let mut outstanding = 0usize;

        for entry in pool.slots.iter_mut() {
            if !entry.is_backed(&self.source) {
                continue;
            }
            if entry.record.status.is_held() {
                outstanding += 1;
            }
            entry.record.status = BufferStatus {
                position: BufferPosition::None,
                permission: BufferPermission::Available,
            };
            entry.needs_revalidation = false;
            available.push_back(entry.record.index);
        }

        if outstanding > 0 {
            warn!(outstanding, "reset with slots still held");
        }
        pool.available = available;
        pool.active = false;
        sizing.skip_allocation = true;
        info!(retained = pool.allocated, "reset");
    }

    /// Free all memory and invalidate the pool
    ///
    /// Held slots are logged and freed anyway.
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn deinit(&self) {
        self.stop_grow_thread();

        let mut sizing = self.sizing.lock();
        let (memories, handles) = {
            let mut pool = self.pool.lock();
            if !pool.active && pool.allocated == 0 && pool.slots.iter().all(|e| e.memory.is_empty()) {
                debug!("deinit on empty pool");
                sizing.skip_allocation = false;
                return;
            }

            let mut memories = Vec::new();
            let mut handles = Vec::new();
            for entry in pool.slots.iter_mut() {
                if entry.record.status.is_held() {
                    error!(index = entry.record.index, "deinit while slot in process, freeing anyway");
                }
                entry.record.status = BufferStatus::default();
                entry.needs_revalidation = false;
                clear_plane_backing(&mut entry.record);
                entry.record.containers.clear();
                memories.push(std::mem::take(&mut entry.memory));
                if let Some(handle) = entry.service.take() {
                    handles.push(handle);
                }
            }
            pool.available.clear();
            pool.allocated = 0;
            pool.active = false;
            (memories, handles)
        };

        for memory in memories {
            self.free_memory(memory);
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "dropping service buffers still attached");
        }
        sizing.skip_allocation = false;
        sizing.reserved_exhausted = false;
        info!("deinitialized");
    }

    /// Attach a service buffer to a free slot identity
    pub fn supply(&self, buffer: ServiceBuffer, hint: Option<usize>) -> Result<usize> {
        if !self.is_service_supplied() {
            return Err(PipelineError::Unsupported {
                manager: self.name.clone(),
                operation: "supply",
            });
        }

        let expected = {
            let sizing = self.sizing.lock();
            sizing
                .layout
                .as_ref()
                .map(|l| l.image_plane_total())
                .ok_or_else(|| PipelineError::invalid_state(format!("{}: not configured", self.name)))?
        };
        if buffer.planes.len() != expected {
            return Err(PipelineError::invalid_state(format!(
                "{}: supplied {} planes, layout has {}",
                self.name,
                buffer.planes.len(),
                expected
            )));
        }

        let mut pool = self.pool.lock();
        let is_free = |e: &SlotEntry| e.service.is_none();
        let pos = hint
            .and_then(|h| pool.position(h))
            .filter(|pos| is_free(&pool.slots[*pos]))
            .or_else(|| pool.slots.iter().position(is_free))
            .ok_or_else(|| PipelineError::Exhausted(self.name.clone()))?;

        let entry = &mut pool.slots[pos];
        let index = entry.record.index;
        entry.service = Some(buffer);
        entry.record.status = BufferStatus {
            position: BufferPosition::InHal,
            permission: BufferPermission::Available,
        };
        pool.available.push_back(index);
        pool.allocated += 1;
        trace!(manager = %self.name, index, "service buffer supplied");
        Ok(index)
    }

    /// Detach a service buffer and hand it back with an optional release fence
    pub fn return_to_service(&self, index: usize, release_fence: Option<OwnedFd>) -> Result<ServiceBuffer> {
        if !self.is_service_supplied() {
            return Err(PipelineError::Unsupported {
                manager: self.name.clone(),
                operation: "return_to_service",
            });
        }

        let (mut buffer, containers) = {
            let mut pool = self.pool.lock();
            let pos = pool.position(index).ok_or_else(|| PipelineError::InvalidIndex {
                manager: self.name.clone(),
                index,
            })?;
            let Some(buffer) = pool.slots[pos].service.take() else {
                return Err(PipelineError::invalid_state(format!(
                    "{}: slot {} has no service buffer",
                    self.name, index
                )));
            };
            pool.remove_available(index);
            pool.allocated = pool.allocated.saturating_sub(1);
            let entry = &mut pool.slots[pos];
            entry.record.status = BufferStatus {
                position: BufferPosition::InService,
                permission: BufferPermission::None,
            };
            clear_image_planes(&mut entry.record);
            entry.record.containers.clear();
            (buffer, std::mem::take(&mut entry.memory.containers))
        };

        self.destroy_containers(containers);
        if let Some(fd) = release_fence {
            buffer.fence.set_release(fd);
        }
        Ok(buffer)
    }

    pub fn status(&self, index: usize) -> Option<BufferStatus> {
        let pool = self.pool.lock();
        pool.position(index).map(|pos| pool.slots[pos].record.status)
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.status(index)
            .map(|s| s.permission == BufferPermission::Available)
            .unwrap_or(false)
    }

    /// Slot whose first plane is backed by `fd`
    pub fn index_by_fd(&self, fd: RawFd) -> Option<usize> {
        let pool = self.pool.lock();
        pool.slots
            .iter()
            .find(|e| e.record.primary_fd() == Some(fd))
            .map(|e| e.record.index)
    }

    pub fn available_count(&self) -> usize {
        self.pool.lock().available.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.pool.lock().allocated
    }

    pub fn allowed_max_count(&self) -> usize {
        self.sizing
            .lock()
            .layout
            .as_ref()
            .map(|l| l.config.allowed_max_count)
            .unwrap_or(0)
    }

    pub fn is_allocated(&self) -> bool {
        self.pool.lock().active
    }

    pub fn stats(&self) -> ManagerStats {
        let allowed_max = self.allowed_max_count();
        let pool = self.pool.lock();
        ManagerStats {
            allocated: pool.allocated,
            available: pool.available.len(),
            held: pool.slots.iter().filter(|e| e.record.status.is_held()).count(),
            allowed_max,
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            grown: self.counters.grown.load(Ordering::Relaxed),
            backend_allocs: self.counters.allocs.load(Ordering::Relaxed),
        }
    }

    /// Log every slot's state
    pub fn dump(&self) {
        let pool = self.pool.lock();
        info!(
            manager = %self.name,
            allocated = pool.allocated,
            available = ?pool.available,
            active = pool.active,
            "buffer manager dump"
        );
        for entry in &pool.slots {
            debug!(
                manager = %self.name,
                index = entry.record.index,
                position = ?entry.record.status.position,
                permission = ?entry.record.status.permission,
                fd = ?entry.record.primary_fd(),
                kind = %entry.record.kind,
                revalidate = entry.needs_revalidation,
                "slot"
            );
        }
    }

    fn note_acquired(&self) {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        counter!("framegraph_buffers_acquired_total", "manager" => self.name.clone()).increment(1);
    }

    fn take_available(
        &self,
        hint: Option<usize>,
        position: BufferPosition,
    ) -> Result<Option<(BufferSlot, FenceGuard)>> {
        let mut pool = self.pool.lock();
        if !pool.active {
            return Err(PipelineError::invalid_state(format!(
                "{}: acquire before allocate",
                self.name
            )));
        }

        let index = match hint {
            Some(h) if pool.remove_available(h) => Some(h),
            _ => pool.available.pop_front(),
        };
        let Some(index) = index else {
            return Ok(None);
        };

        let pos = pool.position(index).ok_or_else(|| PipelineError::InvalidIndex {
            manager: self.name.clone(),
            index,
        })?;
        let entry = &mut pool.slots[pos];

        if entry.record.status.is_held() {
            error!(manager = %self.name, index, "queued slot already in process");
            return Err(PipelineError::invalid_state(format!(
                "{}: slot {} queued while in process",
                self.name, index
            )));
        }

        entry.record.status = BufferStatus {
            position,
            permission: BufferPermission::InProcess,
        };

        if entry.needs_revalidation {
            revalidate(entry);
        }

        let fence = match entry.service.as_mut() {
            Some(service) => {
                derive_service_planes(&mut entry.record, &service.planes);
                std::mem::take(&mut service.fence)
            }
            None => FenceGuard::none(),
        };

        trace!(manager = %self.name, index, "acquired");
        Ok(Some((entry.record.clone(), fence)))
    }

    fn finish_acquire(&self, mut slot: BufferSlot, mut fence: FenceGuard) -> Result<BufferSlot> {
        let BufferSource::ServiceSupplied {
            allocator,
            fence_timeout,
        } = &self.source
        else {
            self.note_acquired();
            return Ok(slot);
        };

        if let Err(e) = fence.wait_acquire(*fence_timeout) {
            warn!(manager = %self.name, index = slot.index, "acquire fence wait failed: {}", e);
            self.restore_unacquired(slot.index, Some(fence));
            return Err(e);
        }

        if slot.batch_size > 1 {
            let Some(allocator) = allocator else {
                self.restore_unacquired(slot.index, None);
                return Err(PipelineError::invalid_config(format!(
                    "{}: batch service buffers need an allocator",
                    self.name
                )));
            };
            let containers = match build_containers(allocator.as_ref(), &slot) {
                Ok(c) => c,
                Err(e) => {
                    self.restore_unacquired(slot.index, None);
                    return Err(PipelineError::allocation(&self.name, e.to_string()));
                }
            };
            slot.containers = containers.iter().map(|c| c.fd).collect();
            let mut pool = self.pool.lock();
            if let Some(pos) = pool.position(slot.index) {
                let entry = &mut pool.slots[pos];
                entry.record.containers = slot.containers.clone();
                entry.memory.containers = containers;
            }
        }

        self.note_acquired();
        Ok(slot)
    }

    /// Undo a service acquire that failed before it was counted
    ///
    /// The slot goes back to the head of the queue with its fence, if one is
    /// given; release counters are left alone.
    fn restore_unacquired(&self, index: usize, fence: Option<FenceGuard>) {
        let mut pool = self.pool.lock();
        let Some(pos) = pool.position(index) else {
            return;
        };
        let entry = &mut pool.slots[pos];
        entry.record.status.permission = BufferPermission::Available;
        clear_image_planes(&mut entry.record);
        if let (Some(fence), Some(service)) = (fence, entry.service.as_mut()) {
            service.fence = fence;
        }
        pool.available.push_front(index);
    }

    fn put_back(&self, index: usize, cancel: bool) -> Result<()> {
        let containers = {
            let mut pool = self.pool.lock();
            let pos = pool.position(index).ok_or_else(|| PipelineError::InvalidIndex {
                manager: self.name.clone(),
                index,
            })?;

            if !pool.slots[pos].is_backed(&self.source) {
                return Err(PipelineError::invalid_state(format!(
                    "{}: release of unbacked slot {}",
                    self.name, index
                )));
            }

            if pool.slots[pos].record.status.permission != BufferPermission::InProcess {
                debug!(manager = %self.name, index, "slot already available, release skipped");
                return Ok(());
            }

            let service = self.is_service_supplied();
            let entry = &mut pool.slots[pos];
            entry.record.status = BufferStatus {
                position: if service {
                    BufferPosition::InHal
                } else {
                    BufferPosition::None
                },
                permission: BufferPermission::Available,
            };
            if cancel {
                entry.needs_revalidation = true;
            }
            let containers = if service {
                clear_image_planes(&mut entry.record);
                entry.record.containers.clear();
                std::mem::take(&mut entry.memory.containers)
            } else {
                Vec::new()
            };
            pool.available.push_back(index);
            containers
        };

        self.destroy_containers(containers);

        if cancel {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            counter!("framegraph_buffers_cancelled_total", "manager" => self.name.clone()).increment(1);
            trace!(manager = %self.name, index, "cancelled");
        } else {
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            counter!("framegraph_buffers_released_total", "manager" => self.name.clone()).increment(1);
            trace!(manager = %self.name, index, "released");
        }
        Ok(())
    }

    /// Grow while holding the sizing lock
    ///
    /// With `claim`, the last new slot is handed out directly instead of
    /// being queued.
    fn grow_locked(
        &self,
        sizing: &mut Sizing,
        count: usize,
        claim: Option<BufferPosition>,
    ) -> Result<(usize, Option<BufferSlot>)> {
        let layout = sizing
            .layout
            .clone()
            .ok_or_else(|| PipelineError::invalid_state(format!("{}: not configured", self.name)))?;

        let (allocated, active) = {
            let pool = self.pool.lock();
            (pool.allocated, pool.active)
        };
        if !active {
            return Err(PipelineError::invalid_state(format!(
                "{}: grow before allocate",
                self.name
            )));
        }

        let allowed = layout.config.allowed_max_count;
        let headroom = allowed.saturating_sub(allocated);
        if headroom == 0 {
            return Err(PipelineError::LimitExceeded {
                manager: self.name.clone(),
                allocated,
                bound: allowed,
            });
        }

        let count = if count > headroom {
            warn!(manager = %self.name, requested = count, headroom, "growth clamped to headroom");
            headroom
        } else {
            count
        };

        let mut grown = 0;
        let mut claimed = None;
        for k in 0..count {
            let index = layout.config.start_index + allocated + k;
            let memory = match self.allocate_slot(sizing, &layout, index) {
                Ok(m) => m,
                Err(e) if grown > 0 => {
                    warn!(manager = %self.name, grown, "growth stopped early: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let mut pool = self.pool.lock();
            let position = if k + 1 == count { claim } else { None };
            claimed = self.install(&mut pool, index, memory, position);
            grown += 1;
        }

        self.counters.grown.fetch_add(grown as u64, Ordering::Relaxed);
        counter!("framegraph_buffers_grown_total", "manager" => self.name.clone()).increment(grown as u64);
        debug!(manager = %self.name, grown, "grew");
        Ok((grown, claimed))
    }

    /// Attach memory to a slot; queue it, or claim it when `claim` is set
    fn install(
        &self,
        pool: &mut PoolState,
        index: usize,
        memory: SlotMemory,
        claim: Option<BufferPosition>,
    ) -> Option<BufferSlot> {
        let pos = pool.position(index)?;
        let entry = &mut pool.slots[pos];

        for (plane, alloc) in entry.record.planes.iter_mut().zip(memory.planes.iter()) {
            plane.fd = Some(alloc.fd());
            plane.addr = alloc.addr();
        }
        if let (Some(meta), Some(plane)) = (memory.meta.as_ref(), entry.record.planes.last_mut()) {
            plane.fd = Some(meta.fd());
            plane.addr = meta.addr();
        }
        if let Some(kind) = memory.planes.first().map(|a| kind_of(entry.record.kind, a)) {
            entry.record.kind = kind;
        }
        entry.record.containers = memory.containers.iter().map(|c| c.fd).collect();
        entry.memory = memory;
        entry.needs_revalidation = false;
        pool.allocated += 1;

        match claim {
            Some(position) => {
                entry.record.status = BufferStatus {
                    position,
                    permission: BufferPermission::InProcess,
                };
                Some(entry.record.clone())
            }
            None => {
                entry.record.status = BufferStatus {
                    position: BufferPosition::None,
                    permission: BufferPermission::Available,
                };
                pool.available.push_back(index);
                None
            }
        }
    }

    fn allocate_slot(&self, sizing: &mut Sizing, layout: &ResolvedLayout, index: usize) -> Result<SlotMemory> {
        let Some(allocator) = self.source.allocator() else {
            return Err(PipelineError::allocation(&self.name, "no allocator"));
        };
        let cfg = &layout.config;
        let mut memory = SlotMemory::default();

        let offset = index - cfg.start_index;
        let mut kind = cfg.kind;
        if kind.is_reserved() && (sizing.reserved_exhausted || (cfg.reserved_count > 0 && offset >= cfg.reserved_count)) {
            debug!(manager = %self.name, index, "slot beyond reserved range, using {}", kind.fallback());
            kind = kind.fallback();
        }

        for spec in layout.plane_template().iter().take(layout.image_plane_total()) {
            match self.alloc_plane(allocator.as_ref(), spec.size, kind, cfg) {
                Ok(a) => memory.planes.push(a),
                Err(e) if kind.is_reserved() => {
                    warn!(
                        manager = %self.name,
                        index,
                        "reserved allocation failed ({}), falling back to {}",
                        e,
                        kind.fallback()
                    );
                    sizing.reserved_exhausted = true;
                    kind = kind.fallback();
                    match self.alloc_plane(allocator.as_ref(), spec.size, kind, cfg) {
                        Ok(a) => memory.planes.push(a),
                        Err(e) => {
                            self.free_memory(memory);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.free_memory(memory);
                    return Err(e);
                }
            }
        }

        if cfg.create_meta_plane {
            match self.allocate_meta() {
                Ok(meta) => memory.meta = Some(meta),
                Err(e) => {
                    self.free_memory(memory);
                    return Err(e);
                }
            }
        }

        if cfg.batch_size > 1 {
            let per_image = cfg.planes.len();
            for p in 0..per_image {
                let fds: Vec<RawFd> = (0..cfg.batch_size)
                    .map(|b| memory.planes[b * per_image + p].fd())
                    .collect();
                match allocator.create_container(&fds, cfg.batch_size) {
                    Ok(c) => memory.containers.push(c),
                    Err(e) => {
                        self.free_memory(memory);
                        return Err(PipelineError::allocation(&self.name, e.to_string()));
                    }
                }
            }
        }

        Ok(memory)
    }

    fn alloc_plane(
        &self,
        allocator: &dyn DmaAllocator,
        size: usize,
        kind: BufferKind,
        cfg: &BufferManagerConfig,
    ) -> Result<DmaAllocation> {
        let attempts = if kind.is_reserved() && cfg.mode == AllocationMode::OnDemand {
            RESERVED_ALLOC_RETRIES
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(RESERVED_RETRY_BACKOFF);
            }
            self.counters.allocs.fetch_add(1, Ordering::Relaxed);
            match allocator.alloc(size, kind.flags(), cfg.needs_cpu_mapping) {
                Ok(a) => return Ok(a),
                Err(e) => {
                    debug!(manager = %self.name, attempt, size, %kind, "plane allocation failed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(PipelineError::allocation(&self.name, reason))
    }

    fn allocate_meta(&self) -> Result<DmaAllocation> {
        let Some(allocator) = self.source.allocator() else {
            return Err(PipelineError::allocation(&self.name, "no allocator for meta plane"));
        };
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        allocator
            .alloc(META_PLANE_SIZE, BufferKind::NonCached.flags(), true)
            .map_err(|e| PipelineError::allocation(&self.name, e.to_string()))
    }

    fn free_memory(&self, memory: SlotMemory) {
        let Some(allocator) = self.source.allocator() else {
            return;
        };
        for container in memory.containers {
            allocator.destroy_container(container);
        }
        for plane in memory.planes {
            allocator.free(plane);
        }
        if let Some(meta) = memory.meta {
            allocator.free(meta);
        }
    }

    fn destroy_containers(&self, containers: Vec<ContainerHandle>) {
        if containers.is_empty() {
            return;
        }
        if let Some(allocator) = self.source.allocator() {
            for container in containers {
                allocator.destroy_container(container);
            }
        }
    }

    fn spawn_grow_thread(self: &Arc<Self>) -> Result<()> {
        self.grow_cancel.store(false, Ordering::Release);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name(format!("grow-{}", self.name))
            .spawn(move || silent_grow(weak))?;
        *self.grow_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop_grow_thread(&self) {
        self.grow_cancel.store(true, Ordering::Release);
        let handle = self.grow_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(manager = %self.name, "growth thread panicked");
            }
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Background growth for silent mode, one slot per step
fn silent_grow(manager: Weak<BufferManager>) {
    loop {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.grow_cancel.load(Ordering::Acquire) {
            debug!(manager = %manager.name, "silent growth cancelled");
            return;
        }

        let mut sizing = manager.sizing.lock();
        match manager.grow_locked(&mut sizing, 1, None) {
            Ok(_) => {}
            Err(PipelineError::LimitExceeded { allocated, .. }) => {
                info!(manager = %manager.name, allocated, "silent growth complete");
                return;
            }
            Err(e) => {
                warn!(manager = %manager.name, "silent growth stopped: {}", e);
                return;
            }
        }
        drop(sizing);
        std::thread::yield_now();
    }
}

fn kind_of(configured: BufferKind, alloc: &DmaAllocation) -> BufferKind {
    use super::allocator::Heap;
    match (configured.is_reserved(), alloc.flags().heap) {
        (true, Heap::System) => configured.fallback(),
        _ => configured,
    }
}

fn clear_plane_backing(record: &mut BufferSlot) {
    for plane in record.planes.iter_mut() {
        plane.fd = None;
        plane.addr = None;
    }
}

/// Forget image plane descriptors; the meta plane is manager-owned
fn clear_image_planes(record: &mut BufferSlot) {
    let end = if record.has_meta_plane {
        record.planes.len().saturating_sub(1)
    } else {
        record.planes.len()
    };
    for plane in record.planes[..end].iter_mut() {
        plane.fd = None;
        plane.addr = None;
    }
}

fn derive_service_planes(record: &mut BufferSlot, planes: &[ExternalPlane]) {
    for (dst, src) in record.planes.iter_mut().zip(planes.iter()) {
        *dst = PlaneInfo {
            fd: Some(src.fd),
            addr: src.addr,
            size: src.size,
            stride: src.stride,
        };
    }
}

fn build_containers(
    allocator: &dyn DmaAllocator,
    slot: &BufferSlot,
) -> std::result::Result<Vec<ContainerHandle>, super::allocator::AllocError> {
    let per_image = slot.image_plane_count();
    let mut containers = Vec::with_capacity(per_image);
    for p in 0..per_image {
        let fds: Vec<RawFd> = (0..slot.batch_size)
            .filter_map(|b| slot.planes.get(b * per_image + p).and_then(|pl| pl.fd))
            .collect();
        match allocator.create_container(&fds, slot.batch_size) {
            Ok(c) => containers.push(c),
            Err(e) => {
                for c in containers {
                    allocator.destroy_container(c);
                }
                return Err(e);
            }
        }
    }
    Ok(containers)
}

/// Scrub a slot returned through the cancel path
fn revalidate(entry: &mut SlotEntry) {
    if let Some(meta) = entry.memory.meta.as_mut() {
        meta.fill(0);
    }
    entry.needs_revalidation = false;
    debug!(index = entry.record.index, "slot re-validated after cancel");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::allocator::{AllocError, HeapAllocator, MemoryFlags};
    use crate::buffer::layout::PlaneSpec;
    use crate::buffer::slot::VIDEO_MAX_FRAME;

    fn planes() -> Vec<PlaneSpec> {
        vec![PlaneSpec::new(4096, 64), PlaneSpec::new(2048, 64)]
    }

    /// Heap that takes a while per allocation, so background growth is
    /// still running when the test acts on it
    struct SlowHeap(Arc<HeapAllocator>);

    impl DmaAllocator for SlowHeap {
        fn alloc(
            &self,
            size: usize,
            flags: MemoryFlags,
            map: bool,
        ) -> std::result::Result<DmaAllocation, AllocError> {
            std::thread::sleep(Duration::from_millis(5));
            self.0.alloc(size, flags, map)
        }

        fn free(&self, allocation: DmaAllocation) {
            self.0.free(allocation)
        }

        fn create_container(
            &self,
            fds: &[RawFd],
            batch_size: usize,
        ) -> std::result::Result<ContainerHandle, AllocError> {
            self.0.create_container(fds, batch_size)
        }

        fn destroy_container(&self, container: ContainerHandle) {
            self.0.destroy_container(container)
        }
    }

    fn silent_pool(requested: usize, allowed: usize) -> (Arc<BufferManager>, Arc<HeapAllocator>) {
        let heap = Arc::new(HeapAllocator::new());
        let manager = BufferManager::with_pool("silent", Arc::new(SlowHeap(heap.clone())));
        manager
            .configure(&BufferManagerConfig::new(planes(), requested, allowed).with_mode(AllocationMode::Silent))
            .unwrap();
        manager.allocate().unwrap();
        (manager, heap)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn pool(config: BufferManagerConfig) -> (Arc<BufferManager>, Arc<HeapAllocator>) {
        let heap = Arc::new(HeapAllocator::new());
        let manager = BufferManager::with_pool("test", heap.clone());
        manager.configure(&config).unwrap();
        manager.allocate().unwrap();
        (manager, heap)
    }

    #[test]
    fn test_acquire_release_cycle() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 3, 3));
        assert_eq!(manager.available_count(), 3);

        let slot = manager.acquire(None).unwrap();
        assert!(slot.is_backed());
        assert!(slot.status.is_held());
        assert_eq!(manager.available_count(), 2);

        manager.release(slot.index).unwrap();
        assert_eq!(manager.available_count(), 3);
        assert!(manager.is_available(slot.index));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 2, 2));
        let slot = manager.acquire(None).unwrap();
        manager.release(slot.index).unwrap();
        manager.release(slot.index).unwrap();
        assert_eq!(manager.available_count(), 2);
        assert_eq!(manager.stats().released, 1);
    }

    #[test]
    fn test_hint_is_honoured() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 4, 4));
        let slot = manager.acquire(Some(2)).unwrap();
        assert_eq!(slot.index, 2);

        // held hint falls back to the queue head
        let other = manager.acquire(Some(2)).unwrap();
        assert_eq!(other.index, 0);
    }

    #[test]
    fn test_at_once_exhausts() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 1, 4));
        manager.acquire(None).unwrap();
        assert!(matches!(manager.acquire(None), Err(PipelineError::Exhausted(_))));
    }

    #[test]
    fn test_acquire_before_allocate() {
        let heap = Arc::new(HeapAllocator::new());
        let manager = BufferManager::with_pool("test", heap);
        manager.configure(&BufferManagerConfig::new(planes(), 1, 1)).unwrap();
        assert!(matches!(manager.acquire(None), Err(PipelineError::InvalidState(_))));
    }

    #[test]
    fn test_release_out_of_range() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 2, 2));
        assert!(matches!(manager.release(7), Err(PipelineError::InvalidIndex { .. })));
    }

    #[test]
    fn test_grow_clamps_to_headroom() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 2, 4));
        assert_eq!(manager.grow(5).unwrap(), 2);
        assert_eq!(manager.allocated_count(), 4);
        assert!(matches!(manager.grow(1), Err(PipelineError::LimitExceeded { .. })));
    }

    #[test]
    fn test_shrink_rules() {
        let (manager, heap) = pool(BufferManagerConfig::new(planes(), 1, 3));
        assert!(matches!(manager.shrink(), Err(PipelineError::LimitExceeded { .. })));

        manager.grow(1).unwrap();
        let a = manager.acquire(None).unwrap();
        let b = manager.acquire(None).unwrap();
        assert_eq!(b.index, 1);
        assert!(matches!(manager.shrink(), Err(PipelineError::InUse { index: 1, .. })));

        manager.release(b.index).unwrap();
        manager.shrink().unwrap();
        assert_eq!(manager.allocated_count(), 1);
        assert_eq!(heap.stats().live, 2);
        manager.release(a.index).unwrap();
    }

    #[test]
    fn test_start_index_offset() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 2, 2).with_start_index(10));
        let slot = manager.acquire(None).unwrap();
        assert_eq!(slot.index, 10);
        assert!(manager.release(0).is_err());
        manager.release(10).unwrap();
    }

    #[test]
    fn test_index_by_fd() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 2, 2));
        let slot = manager.acquire(Some(1)).unwrap();
        let fd = slot.primary_fd().unwrap();
        assert_eq!(manager.index_by_fd(fd), Some(1));
        assert_eq!(manager.index_by_fd(-5), None);
    }

    #[test]
    fn test_cancel_scrubs_meta_plane() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 1, 1).with_meta_plane(true));
        let slot = manager.acquire(None).unwrap();
        assert!(slot.meta_plane().and_then(|p| p.addr).is_some());

        manager.cancel(slot.index).unwrap();
        assert_eq!(manager.stats().cancelled, 1);
        let again = manager.acquire(None).unwrap();
        assert_eq!(again.index, slot.index);
    }

    #[test]
    fn test_batch_containers_built_and_destroyed() {
        let (manager, heap) = pool(BufferManagerConfig::new(planes(), 2, 2).with_batch_size(2));
        let slot = manager.acquire(None).unwrap();
        assert_eq!(slot.planes.len(), 4);
        assert_eq!(slot.containers.len(), 2);
        assert_eq!(heap.stats().containers_created, 4);

        manager.release(slot.index).unwrap();
        manager.deinit();
        assert_eq!(heap.stats().containers_destroyed, 4);
    }

    #[test]
    fn test_deinit_frees_held_slots() {
        let (manager, heap) = pool(BufferManagerConfig::new(planes(), 2, 2));
        let _held = manager.acquire(None).unwrap();
        manager.deinit();
        assert_eq!(heap.stats().live, 0);
        assert!(!manager.is_allocated());
        // idempotent
        manager.deinit();
    }

    #[test]
    fn test_configure_rejected_while_allocated() {
        let (manager, _heap) = pool(BufferManagerConfig::new(planes(), 1, 1));
        assert!(manager.configure(&BufferManagerConfig::new(planes(), 2, 2)).is_err());
    }

    #[test]
    fn test_service_grow_unsupported() {
        let manager = Arc::new(BufferManager::new("svc", BufferSource::service(None)));
        manager.configure(&BufferManagerConfig::new(planes(), 2, 2)).unwrap();
        manager.allocate().unwrap();
        assert!(matches!(manager.grow(1), Err(PipelineError::Unsupported { .. })));
        assert!(matches!(manager.shrink(), Err(PipelineError::Unsupported { .. })));
    }

    #[test]
    fn test_service_planes_rederived() {
        let manager = Arc::new(BufferManager::new("svc", BufferSource::service(None)));
        manager.configure(&BufferManagerConfig::new(planes(), 2, 2)).unwrap();
        manager.allocate().unwrap();

        let ext = |fd| ExternalPlane {
            fd,
            addr: Some(0x1000 * fd as usize),
            size: 4096,
            stride: 64,
        };
        let index = manager
            .supply(ServiceBuffer::new(vec![ext(40), ext(41)]), None)
            .unwrap();

        let slot = manager.acquire(None).unwrap();
        assert_eq!(slot.index, index);
        assert_eq!(slot.planes[0].fd, Some(40));
        assert_eq!(slot.planes[1].addr, Some(0x1000 * 41));

        manager.release(index).unwrap();
        let status = manager.status(index).unwrap();
        assert_eq!(status.permission, BufferPermission::Available);

        let returned = manager.return_to_service(index, None).unwrap();
        assert_eq!(returned.planes.len(), 2);
        assert_eq!(manager.allocated_count(), 0);
        assert_eq!(manager.status(index).unwrap().position, BufferPosition::InService);
    }

    #[test]
    fn test_silent_growth_reaches_allowed_max() {
        let (manager, _heap) = silent_pool(2, 6);
        assert!(wait_for(|| manager.allocated_count() == 6));
        assert!(wait_for(|| manager.grow_thread.lock().as_ref().map_or(true, |h| h.is_finished())));

        assert_eq!(manager.available_count(), 6);
        assert_eq!(manager.stats().grown, 4);
        assert!(matches!(manager.grow(1), Err(PipelineError::LimitExceeded { .. })));
    }

    #[test]
    fn test_reset_joins_silent_growth_and_allocate_resumes_it() {
        let (manager, heap) = silent_pool(1, VIDEO_MAX_FRAME);
        manager.reset();
        assert!(manager.grow_thread.lock().is_none());

        let retained = manager.allocated_count();
        let live = heap.stats().live;
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.allocated_count(), retained);
        assert_eq!(heap.stats().live, live);

        manager.allocate().unwrap();
        assert!(wait_for(|| manager.allocated_count() == VIDEO_MAX_FRAME));
        assert_eq!(manager.available_count(), VIDEO_MAX_FRAME);
        manager.deinit();
    }

    #[test]
    fn test_deinit_joins_silent_growth() {
        let (manager, heap) = silent_pool(1, VIDEO_MAX_FRAME);
        manager.deinit();
        assert!(manager.grow_thread.lock().is_none());
        assert_eq!(heap.stats().live, 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(heap.stats().live, 0);
        assert_eq!(manager.allocated_count(), 0);
    }

    #[test]
    fn test_failed_batch_service_acquire_is_not_counted() {
        let manager = Arc::new(BufferManager::new("svc", BufferSource::service(None)));
        manager
            .configure(&BufferManagerConfig::new(vec![PlaneSpec::new(4096, 64)], 2, 2).with_batch_size(2))
            .unwrap();
        manager.allocate().unwrap();

        let ext = |fd| ExternalPlane {
            fd,
            addr: None,
            size: 4096,
            stride: 64,
        };
        let index = manager
            .supply(ServiceBuffer::new(vec![ext(50), ext(51)]), None)
            .unwrap();

        assert!(matches!(manager.acquire(None), Err(PipelineError::InvalidConfig(_))));
        let stats = manager.stats();
        assert_eq!(stats.acquired, 0);
        assert_eq!(stats.released, 0);
        assert_eq!(stats.held, 0);
        assert!(manager.is_available(index));
    }
}
