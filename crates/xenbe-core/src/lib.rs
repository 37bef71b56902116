//! # xenbe-core
//!
//! Shared foundation for Xen paravirtualized device backends: identifiers,
//! the frontend connection-state enumeration, store path conventions, and the
//! control-plane boundary traits.
//!
//! This crate has no dependency on a hypervisor driver.  The real store,
//! event-channel and grant-table bindings live behind the traits in
//! [`control`]; an in-memory implementation is provided in
//! [`control::mock`] for tests and simulation.
//!
//! # Architecture overview (for beginners)
//!
//! A paravirtualized device is split in two halves.  The *frontend* runs in a
//! guest domain and the *backend* runs in a privileged domain.  The halves
//! find each other through the **store**, a hierarchical key/value namespace:
//!
//! ```text
//! /local/domain/<guest>/device/<class>/<dev>/state       frontend state
//! /local/domain/<guest>/device/<class>/<dev>/backend-id  which backend serves it
//! ```
//!
//! The backend watches those paths, and once a frontend shows up it binds an
//! **event channel** (an inter-domain interrupt) and maps shared pages through
//! the **grant table**.
//!
//! - **`domain`** – identifiers, connection states, and path helpers.
//! - **`control`** – the traits a platform driver layer implements.

pub mod control;
pub mod domain;

pub use control::{
    ControlPlane, ControlPlaneError, EventChannelHandle, GrantTableHandle, MappedPages,
    PageProtection, RawWatchEvent, StoreHandle,
};
pub use domain::ids::{DeviceId, DomainId, FrontendKey, IdParseError};
pub use domain::state::ConnectionState;
