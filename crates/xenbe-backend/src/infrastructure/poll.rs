//! Cancellable blocking wait on a driver descriptor.
//!
//! Every background loop in the runtime blocks in [`CancellableWait::wait`].
//! The wait polls two descriptors: the watched source and the read side of a
//! private socket pair.  [`CancellableWait::cancel`] writes one byte to the
//! other side of the pair, which wakes the poller no matter where it is in
//! its cycle, so a cancel issued just before `wait` is never lost.
//!
//! Cancellation is sticky: once cancelled, every later `wait` returns
//! [`WaitOutcome::Cancelled`] immediately.  Loops create a fresh wait each
//! time they are started.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

/// Readiness conditions a wait is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterest(libc::c_short);

impl PollInterest {
    /// Data is available to read.
    pub const READABLE: PollInterest = PollInterest(libc::POLLIN);
    /// Urgent data is available to read.
    pub const PRIORITY: PollInterest = PollInterest(libc::POLLPRI);

    pub fn union(self, other: PollInterest) -> PollInterest {
        PollInterest(self.0 | other.0)
    }

    fn bits(self) -> libc::c_short {
        self.0
    }
}

/// How a [`CancellableWait::wait`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The watched source is ready.
    Ready,
    /// [`CancellableWait::cancel`] was called.
    Cancelled,
}

/// A blocking wait over one descriptor that another thread can interrupt.
pub struct CancellableWait {
    source: RawFd,
    interest: PollInterest,
    wake_reader: UnixStream,
    wake_writer: UnixStream,
    cancelled: AtomicBool,
}

impl CancellableWait {
    /// Arms a wait on `source` for the given `interest`.
    ///
    /// The descriptor is borrowed: the caller keeps ownership and must keep it
    /// open for as long as the wait is used.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the self-signal socket pair cannot be created.
    pub fn arm(source: RawFd, interest: PollInterest) -> io::Result<Self> {
        let (wake_reader, wake_writer) = UnixStream::pair()?;
        wake_writer.set_nonblocking(true)?;
        Ok(Self {
            source,
            interest,
            wake_reader,
            wake_writer,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Blocks until the source is ready or the wait is cancelled.
    ///
    /// Interruption by a signal (`EINTR`) is retried transparently.
    ///
    /// # Errors
    ///
    /// Fails for unrecoverable conditions on the source: hang-up, invalid
    /// descriptor, or a poll error condition.
    pub fn wait(&self) -> io::Result<WaitOutcome> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(WaitOutcome::Cancelled);
        }

        let mut fds = [
            libc::pollfd {
                fd: self.source,
                events: self.interest.bits(),
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            fds[0].revents = 0;
            fds[1].revents = 0;

            // SAFETY: `fds` is a valid array of two initialised pollfd structs
            // that outlives the call.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    trace!("poll interrupted by signal; retrying");
                    continue;
                }
                return Err(err);
            }

            if fds[1].revents & libc::POLLIN != 0 || self.cancelled.load(Ordering::Acquire) {
                return Ok(WaitOutcome::Cancelled);
            }
            check_error_bits(fds[1].revents, "wake channel")?;
            check_error_bits(fds[0].revents, "watched source")?;

            if fds[0].revents & self.interest.bits() != 0 {
                return Ok(WaitOutcome::Ready);
            }
        }
    }

    /// Interrupts a current or future [`wait`](Self::wait).
    ///
    /// Safe to call from any thread, any number of times, before, during, or
    /// after a wait.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the self-signal byte cannot be written.
    pub fn cancel(&self) -> io::Result<()> {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match (&self.wake_writer).write(&[0xFF]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

fn check_error_bits(revents: libc::c_short, what: &str) -> io::Result<()> {
    if revents & libc::POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("poll invalid request on {what}"),
        ));
    }
    if revents & libc::POLLHUP != 0 {
        return Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("poll hang up on {what}"),
        ));
    }
    if revents & libc::POLLERR != 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("poll error condition on {what}"),
        ));
    }
    Ok(())
}
