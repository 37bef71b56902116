//! Infrastructure layer for the backend runtime.
//!
//! Contains the OS-facing pieces: blocking waits on driver descriptors, the
//! store watch loop, event-channel loops, timers, the deferred-call worker,
//! and configuration file loading.
//!
//! **Dependency rule**: this layer may depend on `xenbe_core`, but MUST NOT
//! import the `application` layer.

pub mod deferred;
pub mod evtchn;
pub mod poll;
pub mod storage;
pub mod store;
pub mod timer;

use std::thread::JoinHandle;

/// Joins a background thread unless the caller *is* that thread.
///
/// A loop callback may stop its own loop; joining itself would deadlock, so in
/// that case the handle is dropped and the loop exits on its own once the
/// callback returns.
pub(crate) fn join_unless_current(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == std::thread::current().id() {
        tracing::debug!("{name}: stop requested from its own thread; not joining");
        return;
    }
    if handle.join().is_err() {
        tracing::error!("{name}: background thread panicked");
    }
}

