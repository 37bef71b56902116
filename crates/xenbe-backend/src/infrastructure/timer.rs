//! One-shot and periodic timers backed by a dedicated thread.
//!
//! The timer thread sleeps on a condition variable until the deadline so that
//! [`TimerService::stop`] can interrupt it immediately instead of waiting out
//! the remaining period.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::join_unless_current;
use crate::error::BackendError;

/// Callback invoked on every expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TimerState {
    terminate: bool,
    running: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Fires a callback after a period, once or repeatedly.
///
/// * `start` while running returns [`BackendError::AlreadyStarted`].  A
///   one-shot timer that already fired may be started again.
/// * `stop` is synchronous: when it returns the callback is not running and
///   will not run again.  Calling it from inside the callback is allowed.
pub struct TimerService {
    callback: TimerCallback,
    periodic: bool,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(callback: TimerCallback, periodic: bool) -> Self {
        Self {
            callback,
            periodic,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    /// Arms the timer to fire after `period` (and every `period` thereafter
    /// when periodic).
    ///
    /// # Errors
    ///
    /// - [`BackendError::AlreadyStarted`] if the timer is running.
    /// - [`BackendError::Spawn`] if the timer thread cannot be created.
    pub fn start(&self, period: Duration) -> Result<(), BackendError> {
        let mut worker = self.worker.lock();
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(BackendError::AlreadyStarted("timer"));
            }
            state.terminate = false;
            state.running = true;
        }
        // A finished one-shot leaves its handle behind; reap it before rearming.
        if let Some(previous) = worker.take() {
            join_unless_current(previous, "timer");
        }

        let shared = Arc::clone(&self.shared);
        let callback = Arc::clone(&self.callback);
        let periodic = self.periodic;
        let handle = thread::Builder::new()
            .name("xenbe-timer".to_string())
            .spawn(move || run(&shared, &callback, period, periodic))
            .map_err(|source| {
                self.shared.state.lock().running = false;
                BackendError::Spawn {
                    name: "timer",
                    source,
                }
            })?;
        *worker = Some(handle);
        debug!(?period, periodic, "timer started");
        Ok(())
    }

    /// Cancels the timer and waits for the thread to exit.  Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.terminate = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            join_unless_current(handle, "timer");
        }
    }

    /// Returns `true` while the timer is armed.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, callback: &TimerCallback, period: Duration, periodic: bool) {
    let mut state = shared.state.lock();
    let mut deadline = Instant::now() + period;
    loop {
        if state.terminate {
            break;
        }
        if !shared.wakeup.wait_until(&mut state, deadline).timed_out() {
            // Woken by stop() or spuriously; the terminate check decides.
            continue;
        }
        if state.terminate {
            break;
        }
        trace!("timer expired");
        MutexGuard::unlocked(&mut state, || callback());
        if !periodic {
            break;
        }
        deadline = Instant::now() + period;
    }
    state.running = false;
}
