//! Thread-per-stage software stand-in for the hardware pipes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::pipe::HardwarePipe;
use super::queue::FrameQueue;
use super::topology::StageId;
use super::worker::{Step, StageWorker, StopFlag, WorkerPool};
use crate::error::{PipelineError, Result};
use crate::frame::{Direction, EntityBufferState, EntityState, FrameHandle};

/// Timing and fault injection of the simulated pipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub latency_us: u64,
    /// Every n-th frame of a stage gets its destination buffers marked bad
    pub error_every: Option<u64>,
    pub queue_timeout_ms: u64,
    /// First device node number; stage ids are added to it
    pub node_base: usize,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            latency_us: 500,
            error_every: None,
            queue_timeout_ms: 100,
            node_base: 0,
        }
    }
}

struct StageCounters {
    pushed: AtomicU64,
    processed: AtomicU64,
}

/// Processes each stage on its own thread with a fixed latency
pub struct SimulatedPipe {
    settings: SimSettings,
    inputs: HashMap<StageId, Arc<FrameQueue<FrameHandle>>>,
    outputs: Arc<RwLock<HashMap<StageId, Arc<FrameQueue<FrameHandle>>>>>,
    counters: HashMap<StageId, Arc<StageCounters>>,
    stop: StopFlag,
    workers: Mutex<WorkerPool>,
}

impl SimulatedPipe {
    pub fn new(stages: impl IntoIterator<Item = StageId>, settings: SimSettings) -> Self {
        let timeout = Duration::from_millis(settings.queue_timeout_ms);
        let mut inputs = HashMap::new();
        let mut counters = HashMap::new();
        for stage in stages {
            inputs.insert(
                stage,
                Arc::new(FrameQueue::with_timeout(format!("pipe-{}-in", stage), timeout)),
            );
            counters.insert(
                stage,
                Arc::new(StageCounters {
                    pushed: AtomicU64::new(0),
                    processed: AtomicU64::new(0),
                }),
            );
        }
        Self {
            settings,
            inputs,
            outputs: Arc::new(RwLock::new(HashMap::new())),
            counters,
            stop: StopFlag::new(),
            workers: Mutex::new(WorkerPool::new()),
        }
    }

    /// Frames pushed to `stage` so far
    pub fn pushed(&self, stage: StageId) -> u64 {
        self.counters
            .get(&stage)
            .map_or(0, |c| c.pushed.load(Ordering::Relaxed))
    }

    pub fn processed(&self, stage: StageId) -> u64 {
        self.counters
            .get(&stage)
            .map_or(0, |c| c.processed.load(Ordering::Relaxed))
    }

    fn input(&self, stage: StageId) -> Result<&Arc<FrameQueue<FrameHandle>>> {
        self.inputs
            .get(&stage)
            .ok_or_else(|| PipelineError::pipe(stage, "stage not served by this pipe"))
    }
}

impl HardwarePipe for SimulatedPipe {
    fn push_frame(&self, frame: FrameHandle, stage: StageId) -> Result<()> {
        if self.stop.is_requested() {
            return Err(PipelineError::Stopped);
        }
        let input = self.input(stage)?;
        trace!(frame = frame.count(), stage = %stage, "queued to pipe");
        input.push(frame)?;
        if let Some(c) = self.counters.get(&stage) {
            c.pushed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn set_output_queue(&self, queue: Arc<FrameQueue<FrameHandle>>, stage: StageId) -> Result<()> {
        self.input(stage)?;
        self.outputs.write().insert(stage, queue);
        Ok(())
    }

    fn start_thread(&self, stage: StageId) -> Result<()> {
        let input = self.input(stage)?.clone();
        if !self.outputs.read().contains_key(&stage) {
            return Err(PipelineError::pipe(stage, "no output queue"));
        }
        let outputs = self.outputs.clone();
        let counters = self.counters.get(&stage).cloned().ok_or_else(|| PipelineError::pipe(stage, "no counters"))?;
        let latency = Duration::from_micros(self.settings.latency_us);
        let error_every = self.settings.error_every;

        let worker = StageWorker::spawn(
            format!("pipe-{}", stage),
            input,
            self.stop.clone(),
            None,
            move |frame: FrameHandle| {
                let n = counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
                let faulty = error_every.is_some_and(|every| every > 0 && n % every == 0);
                process(&frame, stage, latency, faulty);
                let output = outputs.read().get(&stage).cloned();
                match output {
                    Some(queue) => queue.push(frame)?,
                    None => warn!(stage = %stage, "output queue vanished"),
                }
                Ok(Step::Continue)
            },
        )?;
        self.workers.lock().add(worker);
        debug!(stage = %stage, "pipe thread started");
        Ok(())
    }

    fn node_index(&self, stage: StageId) -> Option<usize> {
        self.inputs
            .contains_key(&stage)
            .then(|| self.settings.node_base + stage.0 as usize)
    }

    fn stop(&self) -> Vec<FrameHandle> {
        self.stop.request();
        for input in self.inputs.values() {
            input.release();
        }
        self.workers.lock().join_all();
        self.inputs.values().flat_map(|q| q.drain()).collect()
    }
}

fn process(frame: &FrameHandle, stage: StageId, latency: Duration, faulty: bool) {
    if !frame.is_running() {
        trace!(frame = frame.count(), stage = %stage, "not running, passing through");
        return;
    }
    if frame.set_entity_state(stage, EntityState::Processing).is_err() {
        warn!(frame = frame.count(), stage = %stage, "frame has no entity for stage");
        return;
    }
    if !latency.is_zero() {
        std::thread::sleep(latency);
    }
    let state = if faulty {
        warn!(frame = frame.count(), stage = %stage, "injected buffer error");
        EntityBufferState::Error
    } else {
        EntityBufferState::Complete
    };
    frame.set_stage_buffer_states(stage, Direction::Dst, state);
    if let Err(e) = frame.set_entity_state(stage, EntityState::FrameDone) {
        debug!(frame = frame.count(), stage = %stage, "marking stage done failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameRecord, FrameType, OutputSet};

    #[test]
    fn test_frames_flow_to_output() {
        let stage = StageId(1);
        let pipe = SimulatedPipe::new(
            [stage],
            SimSettings {
                latency_us: 0,
                ..Default::default()
            },
        );
        let out = Arc::new(FrameQueue::with_timeout("out", Duration::from_secs(1)));
        pipe.set_output_queue(out.clone(), stage).unwrap();
        pipe.start_thread(stage).unwrap();

        for count in 0..3 {
            let frame = Arc::new(FrameRecord::new(count, FrameType::Normal, OutputSet::preview(), [stage]));
            pipe.push_frame(frame, stage).unwrap();
        }
        let done: Vec<_> = (0..3).map(|_| out.wait_and_pop().unwrap()).collect();
        assert_eq!(done.iter().map(|f| f.count()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(done.iter().all(|f| f.entity_state(stage) == Some(EntityState::FrameDone)));

        assert!(pipe.stop().is_empty());
        assert_eq!(pipe.processed(stage), 3);
        assert!(matches!(
            pipe.push_frame(done[0].clone(), stage),
            Err(PipelineError::Stopped)
        ));
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let pipe = SimulatedPipe::new([StageId(0)], SimSettings::default());
        assert_eq!(pipe.node_index(StageId(0)), Some(0));
        assert_eq!(pipe.node_index(StageId(5)), None);
        assert!(pipe.start_thread(StageId(0)).is_err());
        assert!(pipe.start_thread(StageId(5)).is_err());
    }
}
