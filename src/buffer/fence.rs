//! Acquire/release fences for externally supplied buffers

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace};

use crate::error::{PipelineError, Result};

/// Default wait for a supplied acquire fence
pub const FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll slices the wait budget is split into
const FENCE_WAIT_SLICES: u32 = 4;

/// Optional fence pair travelling with a service-supplied buffer
///
/// The acquire fence signals that the previous consumer has finished with
/// the buffer; it is consumed by the first successful wait. The release fence
/// is handed back to the service along with the buffer.
#[derive(Debug, Default)]
pub struct FenceGuard {
    acquire: Option<OwnedFd>,
    release: Option<OwnedFd>,
}

impl FenceGuard {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(acquire: Option<OwnedFd>, release: Option<OwnedFd>) -> Self {
        Self { acquire, release }
    }

    pub fn with_acquire(fd: OwnedFd) -> Self {
        Self {
            acquire: Some(fd),
            release: None,
        }
    }

    pub fn has_acquire(&self) -> bool {
        self.acquire.is_some()
    }

    pub fn has_release(&self) -> bool {
        self.release.is_some()
    }

    pub fn set_release(&mut self, fd: OwnedFd) {
        self.release = Some(fd);
    }

    pub fn take_release(&mut self) -> Option<OwnedFd> {
        self.release.take()
    }

    /// Block until the acquire fence signals, then drop it
    ///
    /// A guard without an acquire fence is immediately usable. The budget is
    /// polled in slices; interrupted polls resume with what is left.
    pub fn wait_acquire(&mut self, timeout: Duration) -> Result<()> {
        let Some(fence) = self.acquire.as_ref() else {
            return Ok(());
        };

        let raw = fence.as_raw_fd();
        let deadline = Instant::now() + timeout;
        let slice = (timeout / FENCE_WAIT_SLICES).max(Duration::from_millis(1));

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(fd = raw, ?timeout, "fence timeout");
                return Err(PipelineError::FenceTimeout(timeout));
            }

            let wait_ms = remaining.min(slice).as_millis().min(u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(fence.as_fd(), PollFlags::POLLIN)];

            match poll(&mut fds, PollTimeout::from(wait_ms)) {
                Ok(0) => {
                    trace!(fd = raw, "fence not signalled yet");
                }
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                        error!(fd = raw, ?revents, "fence wait error");
                        return Err(PipelineError::Fence(format!(
                            "fd {} reported {:?}",
                            raw, revents
                        )));
                    }
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(fd = raw, "fence poll failed: {}", e);
                    return Err(PipelineError::Fence(e.to_string()));
                }
            }
        }

        debug!(fd = raw, "fence signalled");
        self.acquire = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn fence_pair() -> (OwnedFd, UnixStream) {
        let (waiter, signaller) = UnixStream::pair().unwrap();
        (OwnedFd::from(waiter), signaller)
    }

    #[test]
    fn test_no_fence_is_ready() {
        let mut guard = FenceGuard::none();
        assert!(guard.wait_acquire(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_signalled_fence_is_consumed() {
        let (fd, mut signaller) = fence_pair();
        let mut guard = FenceGuard::with_acquire(fd);
        signaller.write_all(&[1]).unwrap();

        guard.wait_acquire(Duration::from_millis(200)).unwrap();
        assert!(!guard.has_acquire());
    }

    #[test]
    fn test_unsignalled_fence_times_out() {
        let (fd, _signaller) = fence_pair();
        let mut guard = FenceGuard::with_acquire(fd);

        let err = guard.wait_acquire(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, PipelineError::FenceTimeout(_)));
        assert!(guard.has_acquire());
    }

    #[test]
    fn test_signal_from_other_thread() {
        let (fd, mut signaller) = fence_pair();
        let mut guard = FenceGuard::with_acquire(fd);

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaller.write_all(&[1]).unwrap();
            signaller
        });
        guard.wait_acquire(Duration::from_secs(1)).unwrap();
        drop(t.join().unwrap());
    }

    #[test]
    fn test_release_fence_round_trip() {
        let (fd, _signaller) = fence_pair();
        let mut guard = FenceGuard::none();
        guard.set_release(fd);
        assert!(guard.has_release());
        assert!(guard.take_release().is_some());
        assert!(!guard.has_release());
    }
}
