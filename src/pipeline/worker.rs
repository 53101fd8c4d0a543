//! Stage worker threads
//!
//! Each worker loops over a small state machine: wait for input, process
//! it, dispatch the outcome, then loop or exit. A shared [`StopFlag`] ends
//! every loop at its next state boundary.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use super::queue::FrameQueue;
use crate::error::{PipelineError, Result};

/// Cooperative stop request shared by workers
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a handler wants after processing one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exit,
}

enum WorkerState<T> {
    WaitForInput,
    Process(T),
    Dispatch(Result<Step>),
    Exit,
}

/// Logs consecutive empty waits at powers of two
#[derive(Debug, Default)]
pub struct TimeoutThrottle {
    consecutive: u64,
}

impl TimeoutThrottle {
    /// Record one timeout; true when it should be logged
    pub fn tick(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive.is_power_of_two()
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn count(&self) -> u64 {
        self.consecutive
    }
}

/// What a worker did before it exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Items popped after stop was requested and left unprocessed
    pub abandoned: u64,
}

/// A named thread serving one queue
pub struct StageWorker {
    name: String,
    handle: JoinHandle<WorkerSummary>,
}

impl fmt::Debug for StageWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWorker").field("name", &self.name).finish()
    }
}

impl StageWorker {
    /// Spawn a worker feeding items from `queue` to `handler`
    ///
    /// Handler errors are logged and the loop keeps going; a released queue
    /// or a stop request ends it.
    pub fn spawn<T, F>(
        name: impl Into<String>,
        queue: Arc<FrameQueue<T>>,
        stop: StopFlag,
        core: Option<usize>,
        handler: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) -> Result<Step> + Send + 'static,
    {
        let name = name.into();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(worker = %thread_name, core = id, "could not pin worker");
                    }
                }
                run(&thread_name, &queue, &stop, handler)
            })?;
        debug!(worker = %name, "spawned");
        Ok(Self { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<WorkerSummary> {
        self.handle
            .join()
            .map_err(|_| PipelineError::invalid_state(format!("worker {} panicked", self.name)))
    }
}

fn run<T, F>(name: &str, queue: &FrameQueue<T>, stop: &StopFlag, mut handler: F) -> WorkerSummary
where
    F: FnMut(T) -> Result<Step>,
{
    let mut summary = WorkerSummary::default();
    let mut throttle = TimeoutThrottle::default();
    let mut state = WorkerState::WaitForInput;

    loop {
        state = match state {
            WorkerState::WaitForInput => {
                if stop.is_requested() {
                    WorkerState::Exit
                } else {
                    match queue.wait_and_pop() {
                        Ok(item) => {
                            throttle.reset();
                            WorkerState::Process(item)
                        }
                        Err(PipelineError::Timeout(_)) => {
                            summary.timeouts += 1;
                            if throttle.tick() {
                                debug!(worker = name, waits = throttle.count(), "no input");
                            }
                            WorkerState::WaitForInput
                        }
                        Err(e) => {
                            trace!(worker = name, "wait ended: {}", e);
                            WorkerState::Exit
                        }
                    }
                }
            }
            WorkerState::Process(item) => {
                if stop.is_requested() {
                    summary.abandoned += 1;
                    WorkerState::Exit
                } else {
                    WorkerState::Dispatch(handler(item))
                }
            }
            WorkerState::Dispatch(outcome) => match outcome {
                Ok(Step::Continue) => {
                    summary.processed += 1;
                    WorkerState::WaitForInput
                }
                Ok(Step::Exit) => {
                    summary.processed += 1;
                    WorkerState::Exit
                }
                Err(e) => {
                    summary.errors += 1;
                    if e.is_recoverable() {
                        warn!(worker = name, "processing failed: {}", e);
                    } else {
                        error!(worker = name, "processing failed: {}", e);
                    }
                    WorkerState::WaitForInput
                }
            },
            WorkerState::Exit => break,
        };
    }

    info!(
        worker = name,
        processed = summary.processed,
        errors = summary.errors,
        abandoned = summary.abandoned,
        "worker exited"
    );
    summary
}

/// Workers owned together and joined together
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<StageWorker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, worker: StageWorker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Join every worker; panicked workers are logged and skipped
    pub fn join_all(&mut self) -> Vec<(String, WorkerSummary)> {
        self.workers
            .drain(..)
            .filter_map(|w| {
                let name = w.name.clone();
                match w.join() {
                    Ok(summary) => Some((name, summary)),
                    Err(e) => {
                        error!("{}", e);
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_throttle_powers_of_two() {
        let mut throttle = TimeoutThrottle::default();
        let logged: Vec<u64> = (1..=16).filter_map(|_| throttle.tick().then(|| throttle.count())).collect();
        assert_eq!(logged, vec![1, 2, 4, 8, 16]);
        throttle.reset();
        assert!(throttle.tick());
    }

    #[test]
    fn test_worker_processes_then_exits_on_release() {
        let queue = Arc::new(FrameQueue::with_timeout("w", Duration::from_millis(20)));
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let worker = StageWorker::spawn("w", queue.clone(), StopFlag::new(), None, move |n: u32| {
            counter.fetch_add(n, Ordering::SeqCst);
            Ok(Step::Continue)
        })
        .unwrap();

        for n in 1..=4 {
            queue.push(n).unwrap();
        }
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));
        queue.release();

        let summary = worker.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(summary.processed, 4);
    }

    #[test]
    fn test_handler_errors_do_not_stop_worker() {
        let queue = Arc::new(FrameQueue::with_timeout("w", Duration::from_millis(20)));
        let worker = StageWorker::spawn("w", queue.clone(), StopFlag::new(), None, |n: u32| {
            if n % 2 == 0 {
                Err(PipelineError::Exhausted("pool".into()))
            } else if n == 5 {
                Ok(Step::Exit)
            } else {
                Ok(Step::Continue)
            }
        })
        .unwrap();

        for n in 1..=5 {
            queue.push(n).unwrap();
        }
        let summary = worker.join().unwrap();
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.processed, 3);
    }

    #[test]
    fn test_stop_flag_ends_idle_worker() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::with_timeout("w", Duration::from_millis(5)));
        let stop = StopFlag::new();
        let mut pool = WorkerPool::new();
        pool.add(StageWorker::spawn("w", queue, stop.clone(), None, |_| Ok(Step::Continue)).unwrap());

        thread::sleep(Duration::from_millis(20));
        stop.request();
        let joined = pool.join_all();
        assert_eq!(joined.len(), 1);
        assert!(joined[0].1.timeouts >= 1);
        assert!(pool.is_empty());
    }
}
