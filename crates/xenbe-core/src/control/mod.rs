//! Control-plane boundary.
//!
//! The hypervisor primitives (store, event channels, grant table) are provided
//! by a platform driver layer.  This module names exactly what the backend
//! runtime consumes from that layer, so the runtime never branches on platform.
//!
//! # Handles and polling
//!
//! Both the store and the event-channel handles expose a file descriptor that
//! becomes readable when a watch event or a channel signal is pending.  The
//! runtime blocks on that descriptor and then calls the non-blocking
//! `read_watch` / `pending` to fetch the event.
//!
//! # Closing
//!
//! Handles are closed with an explicit `close()` call rather than on drop, so
//! that the owner controls the release order (for an event channel: unbind
//! first, then close).

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::domain::ids::DomainId;

pub mod mock;

/// Failure of a control-plane call, carrying the underlying OS error.
#[derive(Debug, Error)]
#[error("{operation} failed for {target}: {source}")]
pub struct ControlPlaneError {
    operation: &'static str,
    target: String,
    #[source]
    source: io::Error,
}

impl ControlPlaneError {
    pub fn new(operation: &'static str, target: impl Into<String>, source: io::Error) -> Self {
        Self {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Builds the error from an errno value.
    pub fn from_errno(operation: &'static str, target: impl Into<String>, errno: i32) -> Self {
        Self::new(operation, target, io::Error::from_raw_os_error(errno))
    }

    /// Builds the error from the calling thread's last OS error.
    pub fn last_os_error(operation: &'static str, target: impl Into<String>) -> Self {
        Self::new(operation, target, io::Error::last_os_error())
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The raw OS error code, if the failure came from the OS.
    pub fn os_code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// One fired watch as reported by the store: the path that changed and the
/// token of the registration that observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWatchEvent {
    pub path: String,
    pub token: String,
}

/// Opens the control-plane handles.
pub trait ControlPlane: Send + Sync {
    fn open_store(&self) -> Result<Box<dyn StoreHandle>, ControlPlaneError>;
    fn open_event_channel(&self) -> Result<Box<dyn EventChannelHandle>, ControlPlaneError>;
    fn open_grant_table(&self) -> Result<Box<dyn GrantTableHandle>, ControlPlaneError>;
}

/// An open connection to the hierarchical store.
pub trait StoreHandle: Send + Sync {
    /// Returns the store path of a domain, e.g. `/local/domain/3`.
    fn domain_path(&self, domain: DomainId) -> Result<String, ControlPlaneError>;
    /// Reads a node; `Ok(None)` when the node does not exist.
    fn read(&self, path: &str) -> Result<Option<String>, ControlPlaneError>;
    fn write(&self, path: &str, value: &str) -> Result<(), ControlPlaneError>;
    /// Removes a node and its descendants.
    fn remove(&self, path: &str) -> Result<(), ControlPlaneError>;
    /// Lists child names in store order; `Ok(None)` when the node does not exist.
    fn directory(&self, path: &str) -> Result<Option<Vec<String>>, ControlPlaneError>;
    fn watch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError>;
    fn unwatch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError>;
    /// Fetches the next fired watch without blocking; `Ok(None)` if none is pending.
    fn read_watch(&self) -> Result<Option<RawWatchEvent>, ControlPlaneError>;
    /// Descriptor that is readable while a watch event is pending.
    fn fileno(&self) -> RawFd;
    fn close(&self) -> Result<(), ControlPlaneError>;
}

/// An open event-channel device.
pub trait EventChannelHandle: Send + Sync {
    /// Binds a local port to `remote_port` of `domain`, returning the local port.
    fn bind_interdomain(&self, domain: DomainId, remote_port: u32)
        -> Result<u32, ControlPlaneError>;
    fn notify(&self, local_port: u32) -> Result<(), ControlPlaneError>;
    fn unmask(&self, local_port: u32) -> Result<(), ControlPlaneError>;
    fn unbind(&self, local_port: u32) -> Result<(), ControlPlaneError>;
    /// Fetches the next signalled port without blocking; `Ok(None)` if none.
    fn pending(&self) -> Result<Option<u32>, ControlPlaneError>;
    /// Descriptor that is readable while a signal is pending.
    fn fileno(&self) -> RawFd;
    fn close(&self) -> Result<(), ControlPlaneError>;
}

/// Access protection requested for mapped foreign pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProtection {
    Read,
    ReadWrite,
}

/// A run of foreign pages mapped into this address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPages {
    pub address: usize,
    pub count: usize,
}

/// An open grant-table device, consumed by concrete device handlers.
pub trait GrantTableHandle: Send + Sync {
    fn map_foreign_pages(
        &self,
        domain: DomainId,
        refs: &[u32],
        protection: PageProtection,
    ) -> Result<MappedPages, ControlPlaneError>;
    fn unmap(&self, pages: MappedPages) -> Result<(), ControlPlaneError>;
    fn close(&self) -> Result<(), ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_error_keeps_os_code() {
        let err = ControlPlaneError::from_errno("bind", "port 12", 22);
        assert_eq!(err.os_code(), Some(22));
        assert_eq!(err.operation(), "bind");
        assert_eq!(err.target(), "port 12");
    }

    #[test]
    fn test_control_plane_error_message_names_operation_and_target() {
        let err = ControlPlaneError::new(
            "read",
            "/local/domain/3",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.starts_with("read failed for /local/domain/3"), "got {text}");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
