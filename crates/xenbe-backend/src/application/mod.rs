//! Application layer for the backend runtime.
//!
//! # What lives here? (for beginners)
//!
//! The infrastructure layer knows how to talk to the store and to event
//! channels.  This layer decides *what to do* with what it hears:
//!
//! - **`frontend`**  – the capability a device backend implements
//!   ([`frontend::FrontendFactory`] creating [`frontend::FrontendHandler`]s)
//!   and the [`frontend::FrontendRecord`] view each handler is created from.
//! - **`discovery`** – the [`discovery::DiscoveryEngine`], which tracks
//!   guest domains and their frontend devices and owns every handler it
//!   creates.

pub mod discovery;
pub mod frontend;
