//! Event-channel notifier: binds one inter-domain event channel and turns its
//! interrupts into callbacks on a dedicated thread.
//!
//! # Lifecycle
//!
//! ```text
//! new()  ──► open + bind   (on bind failure the handle is closed again)
//! start() ─► loop: wait → pending → unmask → check port → callback
//! stop()  ─► cancel wait, join loop
//! drop   ──► stop, unbind, close   (unbind failure is logged; close still runs)
//! ```
//!
//! A pending port that differs from the bound local port is a protocol
//! violation: it is reported through the error callback (or logged) and the
//! loop exits without invoking the callback.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use xenbe_core::{ControlPlane, DomainId, EventChannelHandle};

use super::join_unless_current;
use super::poll::{CancellableWait, PollInterest, WaitOutcome};
use crate::error::{BackendError, ErrorCallback};

/// Callback invoked once per received event.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    channel: Box<dyn EventChannelHandle>,
    local_port: u32,
    callback: EventCallback,
    error_callback: Mutex<Option<ErrorCallback>>,
}

struct Worker {
    wait: Arc<CancellableWait>,
    thread: JoinHandle<()>,
}

/// One bound inter-domain event channel.
pub struct EventChannelNotifier {
    shared: Arc<Shared>,
    remote_domain: DomainId,
    remote_port: u32,
    worker: Mutex<Option<Worker>>,
}

impl EventChannelNotifier {
    /// Opens an event-channel handle and binds it to `remote_port` in
    /// `remote_domain`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ControlPlane`] if the open or bind fails.  A
    /// handle opened before a failed bind is closed before returning.
    pub fn new(
        plane: &dyn ControlPlane,
        remote_domain: DomainId,
        remote_port: u32,
        callback: EventCallback,
    ) -> Result<Self, BackendError> {
        let channel = plane.open_event_channel()?;
        let local_port = match channel.bind_interdomain(remote_domain, remote_port) {
            Ok(port) => port,
            Err(e) => {
                if let Err(close_err) = channel.close() {
                    warn!("closing event channel after failed bind: {close_err}");
                }
                return Err(e.into());
            }
        };
        info!(
            "event channel bound: Dom({remote_domain}) port {remote_port} -> local port {local_port}"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                channel,
                local_port,
                callback,
                error_callback: Mutex::new(None),
            }),
            remote_domain,
            remote_port,
            worker: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u32 {
        self.shared.local_port
    }

    pub fn remote_domain(&self) -> DomainId {
        self.remote_domain
    }

    pub fn remote_port(&self) -> u32 {
        self.remote_port
    }

    /// Signals the remote end.  Works whether or not the loop is running.
    pub fn notify(&self) -> Result<(), BackendError> {
        trace!(port = self.shared.local_port, "notify");
        self.shared.channel.notify(self.shared.local_port)?;
        Ok(())
    }

    /// Replaces the loop error handler.  Takes effect for the next error even
    /// while the loop is running.
    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.shared.error_callback.lock() = callback;
    }

    /// Starts the receive loop.
    ///
    /// # Errors
    ///
    /// - [`BackendError::AlreadyStarted`] if the loop is running.
    /// - [`BackendError::Wait`] / [`BackendError::Spawn`] if the loop cannot
    ///   be set up.
    pub fn start(&self) -> Result<(), BackendError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.thread.is_finished()) {
            return Err(BackendError::AlreadyStarted("event channel notifier"));
        }
        if let Some(previous) = worker.take() {
            join_unless_current(previous.thread, "event channel loop");
        }

        let wait = Arc::new(
            CancellableWait::arm(self.shared.channel.fileno(), PollInterest::READABLE)
                .map_err(BackendError::Wait)?,
        );
        let thread = {
            let shared = Arc::clone(&self.shared);
            let wait = Arc::clone(&wait);
            thread::Builder::new()
                .name(format!("xenbe-evtchn-{}", self.shared.local_port))
                .spawn(move || run(&shared, &wait))
                .map_err(|source| BackendError::Spawn {
                    name: "event channel",
                    source,
                })?
        };
        *worker = Some(Worker { wait, thread });
        debug!(port = self.shared.local_port, "event channel loop started");
        Ok(())
    }

    /// Cancels the loop and waits for it to exit.  Safe from any state and
    /// from inside the callback.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if let Err(e) = worker.wait.cancel() {
            warn!("failed to signal event channel loop: {e}");
        }
        join_unless_current(worker.thread, "event channel loop");
        debug!(port = self.shared.local_port, "event channel loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }
}

impl Drop for EventChannelNotifier {
    fn drop(&mut self) {
        self.stop();
        let port = self.shared.local_port;
        if let Err(e) = self.shared.channel.unbind(port) {
            warn!("failed to unbind event channel port {port}: {e}");
        }
        if let Err(e) = self.shared.channel.close() {
            warn!("failed to close event channel: {e}");
        }
        debug!(port, "event channel released");
    }
}

impl Shared {
    fn report(&self, err: BackendError) {
        let callback = self.error_callback.lock().clone();
        match callback {
            Some(callback) => callback(&err),
            None => error!("event channel port {} failed: {err}", self.local_port),
        }
    }

    /// Handles one wake-up.  `Ok(false)` means nothing was pending.
    fn dispatch(&self) -> Result<bool, BackendError> {
        let Some(port) = self.channel.pending()? else {
            return Ok(false);
        };
        self.channel.unmask(port)?;
        if port != self.local_port {
            return Err(BackendError::ProtocolViolation {
                expected: format!("port {}", self.local_port),
                received: format!("port {port}"),
            });
        }
        trace!(port, "event received");
        (self.callback)();
        Ok(true)
    }
}

fn run(shared: &Shared, wait: &CancellableWait) {
    loop {
        match wait.wait() {
            Ok(WaitOutcome::Ready) => {}
            Ok(WaitOutcome::Cancelled) => break,
            Err(e) => {
                shared.report(BackendError::Wait(e));
                break;
            }
        }
        if let Err(e) = shared.dispatch() {
            shared.report(e);
            break;
        }
    }
    debug!(port = shared.local_port, "event channel loop exited");
}
