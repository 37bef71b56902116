//! Store access for the backend runtime.
//!
//! [`StoreClient`] is a cheap, cloneable view over one open store handle that
//! adds typed helpers on top of the raw string interface.
//! [`watch::StoreWatchMultiplexer`] runs the background loop that turns watch
//! events into callbacks.

pub mod watch;

use std::fmt;
use std::sync::Arc;

use tracing::trace;
use xenbe_core::domain::paths::OWN_DOMAIN_ID_NODE;
use xenbe_core::{ConnectionState, ControlPlane, DomainId, StoreHandle};

use crate::error::BackendError;

pub use watch::{StoreWatchMultiplexer, WatchCallback, WatchTrigger};

/// Typed access to the store.
///
/// Missing nodes are reported as `Ok(None)` (or an empty list for
/// directories), never as errors.  A node that exists but cannot be parsed as
/// the requested type yields [`BackendError::InvalidValue`].
#[derive(Clone)]
pub struct StoreClient {
    handle: Arc<dyn StoreHandle>,
}

impl fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("fileno", &self.handle.fileno())
            .finish()
    }
}

impl StoreClient {
    /// Opens a new store connection.
    pub fn open(plane: &dyn ControlPlane) -> Result<Self, BackendError> {
        let handle = plane.open_store()?;
        Ok(Self {
            handle: Arc::from(handle),
        })
    }

    pub fn from_handle(handle: Arc<dyn StoreHandle>) -> Self {
        Self { handle }
    }

    /// The underlying handle, shared with the watch multiplexer.
    pub fn handle(&self) -> &Arc<dyn StoreHandle> {
        &self.handle
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn read_string(&self, path: &str) -> Result<Option<String>, BackendError> {
        let value = self.handle.read(path)?;
        trace!(path, ?value, "store read");
        Ok(value)
    }

    pub fn read_int(&self, path: &str) -> Result<Option<i64>, BackendError> {
        self.read_parsed(path)
    }

    pub fn read_uint(&self, path: &str) -> Result<Option<u64>, BackendError> {
        self.read_parsed(path)
    }

    /// Reads a `state` node.
    ///
    /// Integers outside the known range come back as
    /// [`ConnectionState::Unrecognized`]; only non-numeric text is an error.
    pub fn read_state(&self, path: &str) -> Result<Option<ConnectionState>, BackendError> {
        match self.read_string(path)? {
            None => Ok(None),
            Some(text) => ConnectionState::parse(&text)
                .map(Some)
                .ok_or_else(|| BackendError::InvalidValue {
                    path: path.to_string(),
                    value: text,
                }),
        }
    }

    /// Lists the children of `path`; an absent directory is an empty list.
    pub fn read_directory(&self, path: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.handle.directory(path)?.unwrap_or_default())
    }

    pub fn exists(&self, path: &str) -> Result<bool, BackendError> {
        Ok(self.handle.read(path)?.is_some())
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    pub fn write_string(&self, path: &str, value: &str) -> Result<(), BackendError> {
        trace!(path, value, "store write");
        self.handle.write(path, value)?;
        Ok(())
    }

    pub fn write_int(&self, path: &str, value: i64) -> Result<(), BackendError> {
        self.write_string(path, &value.to_string())
    }

    pub fn write_uint(&self, path: &str, value: u64) -> Result<(), BackendError> {
        self.write_string(path, &value.to_string())
    }

    /// Removes `path` and everything beneath it.
    pub fn remove_path(&self, path: &str) -> Result<(), BackendError> {
        self.handle.remove(path)?;
        Ok(())
    }

    // ── Domains ───────────────────────────────────────────────────────────────

    /// Home path of `domain`, e.g. `/local/domain/3`.
    pub fn domain_path(&self, domain: DomainId) -> Result<String, BackendError> {
        Ok(self.handle.domain_path(domain)?)
    }

    /// Reads the id of the domain this process runs in from the `domid` node.
    pub fn own_domain_id(&self) -> Result<DomainId, BackendError> {
        let text = self
            .read_string(OWN_DOMAIN_ID_NODE)?
            .ok_or_else(|| BackendError::NotFound(OWN_DOMAIN_ID_NODE.to_string()))?;
        text.parse().map_err(|_| BackendError::InvalidValue {
            path: OWN_DOMAIN_ID_NODE.to_string(),
            value: text,
        })
    }

    fn read_parsed<T: std::str::FromStr>(&self, path: &str) -> Result<Option<T>, BackendError> {
        match self.read_string(path)? {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| BackendError::InvalidValue {
                    path: path.to_string(),
                    value: text,
                }),
        }
    }
}
