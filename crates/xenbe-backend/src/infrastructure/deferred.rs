//! Deferred call queue: one worker thread that runs submitted closures in
//! submission order.
//!
//! Submitting returns immediately.  Because a single worker runs every call
//! to completion before starting the next, submitted work is mutually
//! exclusive without the callers holding any lock.
//!
//! # Stop policy
//!
//! [`DeferredCallQueue::stop`] **drains**: every call accepted before `stop`
//! runs, then the worker exits.  Calls submitted after `stop` are rejected
//! with [`BackendError::QueueStopped`].
//!
//! A call that panics is caught and logged; the worker moves on to the next.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use super::join_unless_current;
use crate::error::BackendError;

type DeferredCall = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    calls: VecDeque<DeferredCall>,
    terminate: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

/// Serializes closures onto one dedicated worker thread.
pub struct DeferredCallQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredCallQueue {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Spawn`] if the thread cannot be created.
    pub fn new() -> Result<Self, BackendError> {
        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("xenbe-deferred".to_string())
                .spawn(move || run(&shared))
                .map_err(|source| BackendError::Spawn {
                    name: "deferred call",
                    source,
                })?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `call` to run on the worker after everything submitted earlier.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::QueueStopped`] once [`stop`](Self::stop) has
    /// been requested.
    pub fn submit<F>(&self, call: F) -> Result<(), BackendError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.terminate {
            return Err(BackendError::QueueStopped);
        }
        state.calls.push_back(Box::new(call));
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Number of calls accepted but not yet started.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().calls.len()
    }

    /// Drains the queue and joins the worker.  Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.terminate = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            join_unless_current(worker, "deferred call queue");
        }
    }
}

impl Drop for DeferredCallQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        while let Some(call) = state.calls.pop_front() {
            MutexGuard::unlocked(&mut state, || invoke(call));
        }
        if state.terminate {
            break;
        }
        shared.wakeup.wait(&mut state);
    }
    debug!("deferred call worker exited");
}

fn invoke(call: DeferredCall) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!("deferred call panicked: {reason}");
    }
}
