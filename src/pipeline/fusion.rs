//! Dual-camera frame fusion
//!
//! Two camera graphs each deliver a frame per request to a software sync
//! stage. The primary frame carries both buffers onward: slot 1 holds the
//! primary camera's buffer, slot 2 the secondary's. Depending on the
//! frame's sync type one of them is relabeled as the output (bypass,
//! switch) or both feed the hardware merge stage (sync). Input buffers go
//! back through a [`FrameSelector`] once nothing downstream reads them: a
//! merged frame's inputs when the merge stage completes, a relabeled input
//! when the consumer of the output releases it.
//!
//! A frame aborted before it reaches the sync stage is reported through
//! [`FusionCoordinator::forget`] so its partner is not left waiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::driver::FrameGraphDriver;
use super::topology::{Edge, StageId};
use crate::error::{PipelineError, Result};
use crate::frame::{
    AbortReason, BindingSite, BufferBinding, CameraId, Direction, EntityBufferState, EntityState,
    FrameHandle, FrameState, SyncType,
};

/// Merge output node
pub const OUTPUT_SLOT: usize = 0;
/// Source node carrying the primary camera's buffer
pub const PRIMARY_SLOT: usize = 1;
/// Source node carrying the secondary camera's buffer
pub const SECONDARY_SLOT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DualSettings {
    pub primary_camera: CameraId,
    pub secondary_camera: CameraId,
    pub sync_stage: StageId,
    pub merge_stage: StageId,
}

impl Default for DualSettings {
    fn default() -> Self {
        Self {
            primary_camera: 0,
            secondary_camera: 1,
            sync_stage: StageId(5),
            merge_stage: StageId(6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraRole {
    Primary,
    Secondary,
}

impl CameraRole {
    pub fn slot(&self) -> usize {
        match self {
            Self::Primary => PRIMARY_SLOT,
            Self::Secondary => SECONDARY_SLOT,
        }
    }
}

/// Takes input buffers back once fusion is done with them
pub trait FrameSelector: Send + Sync {
    fn release_buffer(&self, camera: CameraId, buffer: BufferBinding) -> Result<()>;
}

/// Returns buffers straight to the manager that lent them
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagerReturningSelector;

impl FrameSelector for ManagerReturningSelector {
    fn release_buffer(&self, camera: CameraId, buffer: BufferBinding) -> Result<()> {
        trace!(camera, index = buffer.index(), "selector release");
        buffer.release()
    }
}

/// Result of [`FusionCoordinator::prepare_after_sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSync {
    /// The frame was not running and has been aborted
    Dropped,
    /// One input became the output without a merge pass
    Relabeled,
    /// Pushed to the merge stage
    Merging,
}

/// Input slots handed back to the selector after the merge stage
pub fn release_slots(sync_type: SyncType) -> &'static [usize] {
    match sync_type {
        SyncType::Bypass => &[PRIMARY_SLOT],
        SyncType::Switch => &[SECONDARY_SLOT],
        SyncType::Sync => &[PRIMARY_SLOT, SECONDARY_SLOT],
    }
}

enum Arrival {
    Waiting(FrameHandle),
    /// The frame was dropped before sync; its partner must be dropped too
    Dropped,
}

#[derive(Default)]
struct PendingPair {
    primary: Option<Arrival>,
    secondary: Option<Arrival>,
}

impl PendingPair {
    fn side(&mut self, role: CameraRole) -> &mut Option<Arrival> {
        match role {
            CameraRole::Primary => &mut self.primary,
            CameraRole::Secondary => &mut self.secondary,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub merges: u64,
    pub relabels: u64,
    pub dropped: u64,
    pub pending: usize,
}

/// Pairs camera frames at the sync stage and drives them into the merge
pub struct FusionCoordinator {
    settings: DualSettings,
    selector: Arc<dyn FrameSelector>,
    primary: RwLock<Weak<FrameGraphDriver>>,
    secondary: RwLock<Weak<FrameGraphDriver>>,
    pending: Mutex<HashMap<u32, PendingPair>>,
    merges: AtomicU64,
    relabels: AtomicU64,
    dropped: AtomicU64,
}

impl fmt::Debug for FusionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionCoordinator")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl FusionCoordinator {
    pub fn new(settings: DualSettings, selector: Arc<dyn FrameSelector>) -> Self {
        Self {
            settings,
            selector,
            primary: RwLock::new(Weak::new()),
            secondary: RwLock::new(Weak::new()),
            pending: Mutex::new(HashMap::new()),
            merges: AtomicU64::new(0),
            relabels: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &DualSettings {
        &self.settings
    }

    pub fn sync_stage(&self) -> StageId {
        self.settings.sync_stage
    }

    pub fn merge_stage(&self) -> StageId {
        self.settings.merge_stage
    }

    pub fn role_of(&self, camera: CameraId) -> Result<CameraRole> {
        if camera == self.settings.primary_camera {
            Ok(CameraRole::Primary)
        } else if camera == self.settings.secondary_camera {
            Ok(CameraRole::Secondary)
        } else {
            Err(PipelineError::invalid_config(format!(
                "camera {} is not part of the dual pair",
                camera
            )))
        }
    }

    fn camera_of(&self, slot: usize) -> CameraId {
        if slot == SECONDARY_SLOT {
            self.settings.secondary_camera
        } else {
            self.settings.primary_camera
        }
    }

    /// Register the driver serving one of the two cameras
    pub fn attach(&self, driver: &Arc<FrameGraphDriver>) -> Result<()> {
        let slot = match self.role_of(driver.camera())? {
            CameraRole::Primary => {
                driver.topology().stage(self.settings.merge_stage)?;
                &self.primary
            }
            CameraRole::Secondary => &self.secondary,
        };
        *slot.write() = Arc::downgrade(driver);
        debug!(driver = driver.name(), camera = driver.camera(), "attached to fusion");
        Ok(())
    }

    fn driver(&self, role: CameraRole) -> Result<Arc<FrameGraphDriver>> {
        let slot = match role {
            CameraRole::Primary => &self.primary,
            CameraRole::Secondary => &self.secondary,
        };
        slot.read()
            .upgrade()
            .ok_or_else(|| PipelineError::invalid_state(format!("no {:?} driver attached", role)))
    }

    fn site(stage: StageId, direction: Direction, node: usize) -> BindingSite {
        BindingSite {
            stage,
            direction,
            node,
        }
    }

    /// Move the buffer `from_stage` produced into this camera's sync slot
    ///
    /// A frame that is no longer running is aborted instead, returning its
    /// own buffers.
    pub fn prepare_before_sync(
        &self,
        driver: &FrameGraphDriver,
        frame: &FrameHandle,
        from_stage: StageId,
        edge: &Edge,
    ) -> Result<()> {
        let role = self.role_of(driver.camera())?;
        if !frame.is_running() {
            driver.abort_frame(frame, abort_reason(frame.state()));
            return Ok(());
        }

        let from = Self::site(from_stage, Direction::Dst, edge.from_node);
        let Some(binding) = frame.take_binding(from) else {
            driver.abort_frame(frame, AbortReason::Invalid);
            return Err(PipelineError::invalid_state(format!(
                "frame {}: nothing produced at {:?} for sync",
                frame.count(),
                from
            )));
        };

        let sync = self.settings.sync_stage;
        frame.ensure_entity(sync);
        driver.bind_buffer(sync, frame, Direction::Src, Some(role.slot()), Some(binding))?;
        trace!(frame = frame.count(), ?role, "buffer staged for sync");
        Ok(())
    }

    /// Offer a frame that reached the sync stage
    ///
    /// Frames pair up by request id, either camera first. A bypass primary
    /// needs no partner. A dropped frame takes its partner down with it.
    pub fn offer(&self, driver: &FrameGraphDriver, frame: &FrameHandle) -> Result<()> {
        let role = self.role_of(driver.camera())?;
        let request = frame.request_id();
        let running = frame.is_running();
        let sync_type = frame.sync_type();

        if sync_type == Some(SyncType::Bypass) {
            // Bypass never pairs: the primary passes alone, the secondary is dropped
            self.pending.lock().remove(&request);
            self.settle(frame);
            return match (role, running) {
                (CameraRole::Primary, true) => self.sync_pair(frame.clone(), None).map(|_| ()),
                (CameraRole::Primary, false) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    driver.abort_frame(frame, abort_reason(frame.state()));
                    Ok(())
                }
                (CameraRole::Secondary, _) => {
                    debug!(frame = frame.count(), "secondary frame not needed for bypass");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    driver.abort_frame(frame, AbortReason::Skipped);
                    Ok(())
                }
            };
        }

        let partner = {
            let mut pending = self.pending.lock();
            let pair = pending.entry(request).or_default();
            let other = match role {
                CameraRole::Primary => CameraRole::Secondary,
                CameraRole::Secondary => CameraRole::Primary,
            };
            match pair.side(other).take() {
                None => {
                    *pair.side(role) = Some(if running {
                        Arrival::Waiting(frame.clone())
                    } else {
                        Arrival::Dropped
                    });
                    None
                }
                Some(arrival) => {
                    pending.remove(&request);
                    Some((other, arrival))
                }
            }
        };

        let Some((other, arrival)) = partner else {
            if !running {
                self.settle(frame);
                driver.abort_frame(frame, abort_reason(frame.state()));
            }
            trace!(request, ?role, "waiting for partner");
            return Ok(());
        };

        match (running, arrival) {
            (true, Arrival::Waiting(partner)) => {
                let (primary, secondary) = match role {
                    CameraRole::Primary => (frame.clone(), partner),
                    CameraRole::Secondary => (partner, frame.clone()),
                };
                self.sync_pair(primary, Some(secondary)).map(|_| ())
            }
            (running, arrival) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request, "dropping pair, one side never reached sync");
                self.settle(frame);
                if !running {
                    driver.abort_frame(frame, abort_reason(frame.state()));
                } else {
                    driver.abort_frame(frame, AbortReason::Skipped);
                }
                if let Arrival::Waiting(partner) = arrival {
                    self.settle(&partner);
                    self.driver(other)?.abort_frame(&partner, AbortReason::Skipped);
                }
                Ok(())
            }
        }
    }

    /// Fold the secondary frame's buffer into the primary frame and retire it
    fn sync_pair(&self, primary: FrameHandle, secondary: Option<FrameHandle>) -> Result<AfterSync> {
        let sync = self.settings.sync_stage;
        if let Some(secondary) = secondary {
            let site = Self::site(sync, Direction::Src, SECONDARY_SLOT);
            if let Some(binding) = secondary.take_binding(site) {
                primary.ensure_entity(sync);
                if let Err(rejected) = primary.bind(site, binding) {
                    warn!(frame = primary.count(), "secondary slot occupied");
                    if let Err(e) = rejected.release() {
                        error!("returning secondary buffer failed: {}", e);
                    }
                }
            }
            self.settle(&secondary);
            self.driver(CameraRole::Secondary)?.finish_frame(&secondary);
        }
        let driver = self.driver(CameraRole::Primary)?;
        self.prepare_after_sync(&driver, &primary)
    }

    /// Route a synced primary frame by its sync type
    ///
    /// Bypass and switch relabel the passing buffer as the output and
    /// complete the merge stage at once; the other input, if present, goes
    /// back to its own manager. Sync acquires a merge output and pushes the
    /// frame to the merge stage exactly once. On failure the merge output is
    /// cancelled, the inputs go back to the selector and the frame is
    /// aborted.
    pub fn prepare_after_sync(&self, driver: &FrameGraphDriver, frame: &FrameHandle) -> Result<AfterSync> {
        self.settle(frame);
        if !frame.is_running() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            driver.abort_frame(frame, abort_reason(frame.state()));
            return Ok(AfterSync::Dropped);
        }
        let Some(sync_type) = frame.sync_type() else {
            driver.abort_frame(frame, AbortReason::Invalid);
            return Err(PipelineError::invalid_state(format!(
                "frame {} reached sync without a sync type",
                frame.count()
            )));
        };

        let sync = self.settings.sync_stage;
        let merge = self.settings.merge_stage;
        frame.ensure_entity(sync);
        frame.ensure_entity(merge);
        let primary = frame.take_binding(Self::site(sync, Direction::Src, PRIMARY_SLOT));
        let secondary = frame.take_binding(Self::site(sync, Direction::Src, SECONDARY_SLOT));

        match sync_type {
            SyncType::Bypass | SyncType::Switch => {
                let (slot, keep, unused) = if sync_type == SyncType::Bypass {
                    (PRIMARY_SLOT, primary, secondary)
                } else {
                    (SECONDARY_SLOT, secondary, primary)
                };
                if let Some(unused) = unused {
                    if let Err(e) = unused.release() {
                        error!(frame = frame.count(), "returning unused input failed: {}", e);
                    }
                }
                let Some(keep) = keep else {
                    driver.abort_frame(frame, AbortReason::Invalid);
                    return Err(PipelineError::invalid_state(format!(
                        "frame {}: {:?} without its input buffer",
                        frame.count(),
                        sync_type
                    )));
                };

                // The kept input is the output; it goes back to the selector
                // when whoever reads the output releases it
                let output = keep.through_selector(self.camera_of(slot), self.selector.clone());
                driver.bind_buffer(merge, frame, Direction::Dst, Some(OUTPUT_SLOT), Some(output))?;
                frame.set_stage_buffer_states(merge, Direction::Dst, EntityBufferState::Complete);
                frame.set_entity_state(merge, EntityState::FrameDone)?;
                self.relabels.fetch_add(1, Ordering::Relaxed);
                trace!(frame = frame.count(), ?sync_type, "relabeled without merge");

                driver.complete_stage(frame, merge)?;
                Ok(AfterSync::Relabeled)
            }
            SyncType::Sync => {
                let (primary, secondary) = match (primary, secondary) {
                    (Some(primary), Some(secondary)) => (primary, secondary),
                    (primary, secondary) => {
                        warn!(frame = frame.count(), "sync frame is missing an input");
                        for (slot, input) in [(PRIMARY_SLOT, primary), (SECONDARY_SLOT, secondary)] {
                            if let Some(input) = input {
                                self.return_input(slot, input);
                            }
                        }
                        self.fail_merge(driver, frame, &[]);
                        return Err(PipelineError::invalid_state(format!(
                            "frame {}: sync needs both inputs",
                            frame.count()
                        )));
                    }
                };
                // Inputs bound first so a failure below can return them
                let inputs = [(PRIMARY_SLOT, primary), (SECONDARY_SLOT, secondary)];
                let mut loose = Vec::new();
                for (slot, binding) in inputs {
                    if let Err(rejected) = frame.bind(Self::site(merge, Direction::Src, slot), binding) {
                        loose.push((slot, rejected));
                    }
                }
                if !loose.is_empty() {
                    self.fail_merge(driver, frame, &[]);
                    for (slot, binding) in loose {
                        self.return_input(slot, binding);
                    }
                    return Err(PipelineError::invalid_state(format!(
                        "frame {}: merge inputs occupied",
                        frame.count()
                    )));
                }

                let output = match driver.acquire_binding(merge, Direction::Dst, OUTPUT_SLOT) {
                    Ok(output) => output,
                    Err(e) => {
                        self.fail_merge(driver, frame, &[]);
                        return Err(e);
                    }
                };
                if let Err(rejected) = frame.bind(Self::site(merge, Direction::Dst, OUTPUT_SLOT), output) {
                    self.fail_merge(driver, frame, &[rejected]);
                    return Err(PipelineError::invalid_state(format!(
                        "frame {}: merge output occupied",
                        frame.count()
                    )));
                }

                if let Err(e) = driver.push_to_stage(frame, merge) {
                    self.fail_merge(driver, frame, &[]);
                    return Err(e);
                }
                self.merges.fetch_add(1, Ordering::Relaxed);
                trace!(frame = frame.count(), "pushed to merge");
                Ok(AfterSync::Merging)
            }
        }
    }

    /// Cancel the merge output, hand the inputs back and abort the frame
    fn fail_merge(&self, driver: &FrameGraphDriver, frame: &FrameHandle, loose_outputs: &[BufferBinding]) {
        let merge = self.settings.merge_stage;
        let out_site = Self::site(merge, Direction::Dst, OUTPUT_SLOT);
        if let Some(mut output) = frame.take_binding(out_site) {
            output.set_state(EntityBufferState::Error);
            if let Err(e) = output.release() {
                error!(frame = frame.count(), "cancelling merge output failed: {}", e);
            }
        }
        for output in loose_outputs {
            if let Err(e) = output.manager().cancel(output.index()) {
                error!(frame = frame.count(), "cancelling merge output failed: {}", e);
            }
        }
        let sync_type = frame.sync_type().unwrap_or(SyncType::Sync);
        for &slot in release_slots(sync_type) {
            if let Some(input) = frame.take_binding(Self::site(merge, Direction::Src, slot)) {
                self.return_input(slot, input);
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        driver.abort_frame(frame, AbortReason::Invalid);
    }

    fn return_input(&self, slot: usize, binding: BufferBinding) {
        let camera = self.camera_of(slot);
        if let Err(e) = self.selector.release_buffer(camera, binding) {
            error!(camera, "selector release failed: {}", e);
        }
    }

    /// Hand the merge inputs back to the selector
    ///
    /// Which inputs go back depends only on the sync type: bypass returns
    /// the primary, switch the secondary, sync both, primary first. A
    /// relabeled input is not at a merge source; it travels with the output.
    pub fn finish_after_merge(&self, frame: &FrameHandle) -> Result<()> {
        let sync_type = frame
            .sync_type()
            .ok_or_else(|| PipelineError::invalid_state(format!("frame {} has no sync type", frame.count())))?;
        let merge = self.settings.merge_stage;
        for &slot in release_slots(sync_type) {
            match frame.take_binding(Self::site(merge, Direction::Src, slot)) {
                Some(input) => self.return_input(slot, input),
                None => trace!(frame = frame.count(), slot, "no input left at merge source"),
            }
        }
        Ok(())
    }

    /// Mark the frame's sync step as settled
    ///
    /// A settled frame no longer takes part in pairing, so aborting it
    /// later leaves the pending table alone.
    fn settle(&self, frame: &FrameHandle) {
        let sync = self.settings.sync_stage;
        if frame.entity_state(sync) == Some(EntityState::Complete) {
            return;
        }
        frame.ensure_entity(sync);
        if let Err(e) = frame.set_entity_state(sync, EntityState::Complete) {
            debug!(frame = frame.count(), "settling sync entity failed: {}", e);
        }
    }

    /// A frame of `driver`'s camera left its graph without pairing
    ///
    /// Covers aborts and frames whose branch into sync failed. A partner
    /// already waiting at sync is aborted with it; otherwise a marker is left
    /// so the partner is dropped when it arrives. Settled frames, and bypass
    /// frames, which never wait, are ignored.
    pub fn forget(&self, driver: &FrameGraphDriver, frame: &FrameHandle) {
        let sync = self.settings.sync_stage;
        let Some(sync_type) = frame.sync_type() else {
            return;
        };
        if sync_type == SyncType::Bypass || frame.entity_state(sync) == Some(EntityState::Complete) {
            return;
        }
        let role = match self.role_of(driver.camera()) {
            Ok(role) => role,
            Err(e) => {
                warn!(driver = driver.name(), "forget: {}", e);
                return;
            }
        };
        self.settle(frame);

        let request = frame.request_id();
        let other = match role {
            CameraRole::Primary => CameraRole::Secondary,
            CameraRole::Secondary => CameraRole::Primary,
        };
        let waiting = {
            let mut pending = self.pending.lock();
            let pair = pending.entry(request).or_default();
            pair.side(role).take();
            match pair.side(other).take() {
                Some(Arrival::Waiting(partner)) => {
                    pending.remove(&request);
                    Some(partner)
                }
                Some(Arrival::Dropped) => {
                    pending.remove(&request);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    None
                }
                None => {
                    *pair.side(role) = Some(Arrival::Dropped);
                    None
                }
            }
        };

        match waiting {
            Some(partner) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request, ?role, "frame aborted before sync, dropping its waiting partner");
                self.settle(&partner);
                match self.driver(other) {
                    Ok(partner_driver) => {
                        partner_driver.abort_frame(&partner, AbortReason::Skipped);
                    }
                    Err(e) => error!(request, "cannot abort waiting partner: {}", e),
                }
            }
            None => debug!(request, ?role, "frame aborted before sync, partner will be dropped"),
        }
    }

    /// Drop every unpaired entry, aborting frames still waiting
    ///
    /// Returns how many entries were cleared.
    pub fn clear_pending(&self) -> usize {
        let drained: Vec<(u32, PendingPair)> = self.pending.lock().drain().collect();
        let cleared = drained.len();
        for (request, pair) in drained {
            for (role, arrival) in [(CameraRole::Primary, pair.primary), (CameraRole::Secondary, pair.secondary)] {
                let Some(Arrival::Waiting(frame)) = arrival else {
                    continue;
                };
                self.settle(&frame);
                match self.driver(role) {
                    Ok(driver) => {
                        driver.abort_frame(&frame, AbortReason::Invalid);
                    }
                    Err(e) => debug!(request, ?role, "waiting frame left to its driver: {}", e),
                }
            }
        }
        if cleared > 0 {
            debug!(cleared, "pending pairs cleared");
        }
        cleared
    }

    pub fn stats(&self) -> FusionStats {
        FusionStats {
            merges: self.merges.load(Ordering::Relaxed),
            relabels: self.relabels.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.lock().len(),
        }
    }
}

fn abort_reason(state: FrameState) -> AbortReason {
    match state {
        FrameState::Skipped => AbortReason::Skipped,
        _ => AbortReason::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_lists() {
        assert_eq!(release_slots(SyncType::Bypass), &[PRIMARY_SLOT]);
        assert_eq!(release_slots(SyncType::Switch), &[SECONDARY_SLOT]);
        assert_eq!(release_slots(SyncType::Sync), &[PRIMARY_SLOT, SECONDARY_SLOT]);
    }

    #[test]
    fn test_roles() {
        let fusion = FusionCoordinator::new(DualSettings::default(), Arc::new(ManagerReturningSelector));
        assert_eq!(fusion.role_of(0).unwrap(), CameraRole::Primary);
        assert_eq!(fusion.role_of(1).unwrap().slot(), SECONDARY_SLOT);
        assert!(fusion.role_of(7).is_err());
        assert_eq!(fusion.camera_of(SECONDARY_SLOT), 1);
    }
}
