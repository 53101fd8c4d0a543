//! Registries of in-flight frames keyed by frame count

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::record::{FrameCount, FrameHandle, FrameState};
use crate::error::{PipelineError, Result};

/// Which registry a frame sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListKind {
    Process,
    PostProcess,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::PostProcess => f.write_str("post-process"),
        }
    }
}

/// Per-state frame counts of a registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListCounts {
    pub running: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub complete: usize,
}

impl ListCounts {
    pub fn total(&self) -> usize {
        self.running + self.skipped + self.invalid + self.complete
    }
}

/// A mutex-guarded registry of frames
///
/// Lookups, insertion and removal happen under the registry lock. When two
/// registries are locked together the process list is always taken first.
pub struct FrameList {
    kind: ListKind,
    frames: Mutex<BTreeMap<FrameCount, FrameHandle>>,
}

impl fmt::Debug for FrameList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameList")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

impl FrameList {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// Look up `count`, creating it with `create` if it is missing
    ///
    /// The check and the insertion happen under one lock hold, so concurrent
    /// callers for the same count all get the same frame. The flag reports
    /// whether this call created it.
    pub fn get_or_try_insert_with<F>(&self, count: FrameCount, create: F) -> Result<(FrameHandle, bool)>
    where
        F: FnOnce() -> Result<FrameHandle>,
    {
        let mut frames = self.frames.lock();
        if let Some(existing) = frames.get(&count) {
            return Ok((existing.clone(), false));
        }
        let frame = create()?;
        frames.insert(count, frame.clone());
        trace!(list = %self.kind, frame = count, "registered");
        Ok((frame, true))
    }

    pub fn insert(&self, frame: FrameHandle) -> Result<()> {
        let mut frames = self.frames.lock();
        Self::insert_locked(&mut frames, self.kind, frame)
    }

    fn insert_locked(
        frames: &mut BTreeMap<FrameCount, FrameHandle>,
        kind: ListKind,
        frame: FrameHandle,
    ) -> Result<()> {
        let count = frame.count();
        if frames.contains_key(&count) {
            return Err(PipelineError::invalid_state(format!(
                "frame {} already in {} list",
                count, kind
            )));
        }
        frames.insert(count, frame);
        Ok(())
    }

    pub fn find(&self, count: FrameCount) -> Option<FrameHandle> {
        self.frames.lock().get(&count).cloned()
    }

    pub fn contains(&self, count: FrameCount) -> bool {
        self.frames.lock().contains_key(&count)
    }

    /// First frame matching `pred`, in frame-count order
    pub fn search<P>(&self, mut pred: P) -> Option<FrameHandle>
    where
        P: FnMut(&FrameHandle) -> bool,
    {
        self.frames.lock().values().find(|f| pred(f)).cloned()
    }

    pub fn remove(&self, count: FrameCount) -> Option<FrameHandle> {
        let removed = self.frames.lock().remove(&count);
        if removed.is_some() {
            trace!(list = %self.kind, frame = count, "deregistered");
        }
        removed
    }

    /// Remove exactly this frame, running `before_remove` under the lock
    ///
    /// Returns false when the registry holds no such frame, in which case
    /// the callback is not run.
    pub fn remove_with<F>(&self, frame: &FrameHandle, before_remove: F) -> bool
    where
        F: FnOnce(&FrameHandle),
    {
        let mut frames = self.frames.lock();
        let present = frames
            .get(&frame.count())
            .is_some_and(|f| std::sync::Arc::ptr_eq(f, frame));
        if !present {
            return false;
        }
        before_remove(frame);
        frames.remove(&frame.count());
        trace!(list = %self.kind, frame = frame.count(), "deregistered");
        true
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn counts(&self) -> Vec<FrameCount> {
        self.frames.lock().keys().copied().collect()
    }

    /// Snapshot of the registered frames
    pub fn frames(&self) -> Vec<FrameHandle> {
        self.frames.lock().values().cloned().collect()
    }

    /// Empty the registry, handing back what it held
    pub fn drain(&self) -> Vec<FrameHandle> {
        let drained: Vec<_> = std::mem::take(&mut *self.frames.lock()).into_values().collect();
        if !drained.is_empty() {
            debug!(list = %self.kind, frames = drained.len(), "drained");
        }
        drained
    }

    pub fn clear(&self) {
        self.drain();
    }

    pub fn frame_counts(&self) -> ListCounts {
        let mut counts = ListCounts::default();
        for frame in self.frames.lock().values() {
            match frame.state() {
                FrameState::Running => counts.running += 1,
                FrameState::Skipped => counts.skipped += 1,
                FrameState::Invalid => counts.invalid += 1,
                FrameState::Complete => counts.complete += 1,
            }
        }
        counts
    }

    /// Move frame `count` from this registry into `to`
    ///
    /// Both locks are held for the move; returns false when this registry
    /// does not hold the frame.
    pub fn transfer(&self, to: &FrameList, count: FrameCount) -> Result<bool> {
        if self.kind == to.kind {
            return Err(PipelineError::invalid_state(format!(
                "transfer within the {} list",
                self.kind
            )));
        }
        let (mut from_guard, mut to_guard) = lock_pair(self, to);
        let Some(frame) = from_guard.remove(&count) else {
            return Ok(false);
        };
        if let Err(e) = Self::insert_locked(&mut to_guard, to.kind, frame.clone()) {
            from_guard.insert(count, frame);
            return Err(e);
        }
        debug!(frame = count, from = %self.kind, to = %to.kind, "transferred");
        Ok(true)
    }
}

type Guard<'a> = MutexGuard<'a, BTreeMap<FrameCount, FrameHandle>>;

fn lock_pair<'a>(from: &'a FrameList, to: &'a FrameList) -> (Guard<'a>, Guard<'a>) {
    if from.kind < to.kind {
        let a = from.frames.lock();
        let b = to.frames.lock();
        (a, b)
    } else {
        let b = to.frames.lock();
        let a = from.frames.lock();
        (a, b)
    }
}
