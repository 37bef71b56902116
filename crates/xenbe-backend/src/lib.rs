//! xenbe-backend library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does a backend do? (for beginners)
//!
//! A backend runs in the privileged domain and serves devices to guests.
//! This crate gives it three things:
//!
//! 1. **Discovery** – [`application::discovery::DiscoveryEngine`] watches the
//!    store for guests and for frontend devices of one class, and creates a
//!    handler per device through a [`application::frontend::FrontendFactory`].
//! 2. **Notification** – [`infrastructure::evtchn::EventChannelNotifier`]
//!    turns inter-domain interrupts into callbacks on a dedicated thread.
//! 3. **Plumbing** – a cancellable blocking wait, a serialized call queue and
//!    a timer, which the handler layer may reuse.

pub mod application;
pub mod error;
pub mod infrastructure;

pub use error::{BackendError, ErrorCallback};
