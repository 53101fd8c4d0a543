//! Frame queues between stages

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::error::{PipelineError, Result};

/// Default bounded wait of a consumer
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

enum QueueItem<T> {
    Item(T),
    /// Wakes one blocked waiter so it can observe a release
    Wake,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    timeouts: AtomicUsize,
    drained: AtomicUsize,
}

/// Counters of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub timeouts: usize,
    pub drained: usize,
}

/// Unbounded FIFO with a bounded blocking pop and a release switch
///
/// Releasing wakes every blocked waiter with [`PipelineError::QueueReleased`]
/// and rejects further pushes until [`FrameQueue::reopen`]. Items still
/// queued at release stay put for [`FrameQueue::drain`].
pub struct FrameQueue<T> {
    name: String,
    tx: Sender<QueueItem<T>>,
    rx: Receiver<QueueItem<T>>,
    released: AtomicBool,
    waiting: AtomicUsize,
    items: AtomicUsize,
    wait_timeout: Duration,
    stats: CachePadded<Stats>,
}

impl<T> fmt::Debug for FrameQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl<T> FrameQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_timeout(name: impl Into<String>, wait_timeout: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
            released: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
            wait_timeout,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn push(&self, item: T) -> Result<()> {
        if self.is_released() {
            return Err(PipelineError::QueueReleased(self.name.clone()));
        }
        self.items.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(QueueItem::Item(item)).is_err() {
            self.items.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::QueueReleased(self.name.clone()));
        }
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop without blocking
    pub fn pop(&self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(QueueItem::Item(item)) => return Some(self.took(item)),
                Ok(QueueItem::Wake) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Pop, blocking up to the queue's wait timeout
    pub fn wait_and_pop(&self) -> Result<T> {
        self.wait_and_pop_for(self.wait_timeout)
    }

    pub fn wait_and_pop_for(&self, timeout: Duration) -> Result<T> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.wait_inner(timeout);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn wait_inner(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.released.load(Ordering::SeqCst) {
                return Err(PipelineError::QueueReleased(self.name.clone()));
            }
            match self.rx.recv_deadline(deadline) {
                Ok(QueueItem::Item(item)) => return Ok(self.took(item)),
                // Stale wake-ups from an earlier release are skipped
                Ok(QueueItem::Wake) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::Timeout(self.name.clone()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::QueueReleased(self.name.clone()));
                }
            }
        }
    }

    fn took(&self, item: T) -> T {
        self.items.fetch_sub(1, Ordering::AcqRel);
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        item
    }

    pub fn len(&self) -> usize {
        self.items.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Wake every waiter and refuse new items
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters = self.waiting.load(Ordering::SeqCst);
        for _ in 0..waiters {
            if self.tx.send(QueueItem::Wake).is_err() {
                break;
            }
        }
        debug!(queue = %self.name, waiters, pending = self.len(), "released");
    }

    /// Accept items again after a release
    pub fn reopen(&self) {
        if self.released.swap(false, Ordering::SeqCst) {
            trace!(queue = %self.name, "reopened");
        }
    }

    /// Take everything still queued, in FIFO order
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self
            .rx
            .drain()
            .filter_map(|item| match item {
                QueueItem::Item(item) => Some(item),
                QueueItem::Wake => None,
            })
            .collect();
        self.items.fetch_sub(drained.len(), Ordering::AcqRel);
        self.stats.drained.fetch_add(drained.len(), Ordering::Relaxed);
        drained
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            drained: self.stats.drained.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new("q");
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let popped: Vec<_> = (0..5).map(|_| queue.wait_and_pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_wait_times_out() {
        let queue: FrameQueue<u32> = FrameQueue::with_timeout("q", Duration::from_millis(10));
        let err = queue.wait_and_pop().unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        assert_eq!(queue.stats().timeouts, 1);
    }

    #[test]
    fn test_release_wakes_waiters() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::with_timeout("q", Duration::from_secs(5)));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.wait_and_pop())
            })
            .collect();

        while queue.waiting.load(Ordering::SeqCst) < 3 {
            thread::yield_now();
        }
        let started = Instant::now();
        queue.release();
        for w in waiters {
            assert!(matches!(w.join().unwrap(), Err(PipelineError::QueueReleased(_))));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_released_queue_rejects_push_and_drains() {
        let queue = FrameQueue::new("q");
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.release();

        assert!(matches!(queue.push(3), Err(PipelineError::QueueReleased(_))));
        assert!(matches!(queue.wait_and_pop(), Err(PipelineError::QueueReleased(_))));
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());

        queue.reopen();
        queue.push(4).unwrap();
        assert_eq!(queue.wait_and_pop().unwrap(), 4);
    }
}
