//! Error type shared by the backend runtime.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use xenbe_core::ControlPlaneError;

/// Error type for backend runtime operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A store, event-channel or grant-table call failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// Waiting on a notification descriptor failed (hang-up, invalid handle,
    /// poll error) or the self-signal channel could not be used.
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),

    /// The control plane reported something other than what was expected.
    #[error("protocol violation: expected {expected}, received {received}")]
    ProtocolViolation { expected: String, received: String },

    /// `start()` was called on a component that is already running.
    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    /// No watch registration or store node exists at the given path.
    #[error("{0} not found")]
    NotFound(String),

    /// A store node held a value that could not be parsed.
    #[error("invalid value {value:?} at {path}")]
    InvalidValue { path: String, value: String },

    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// A call was submitted to a stopped deferred-call queue.
    #[error("deferred call queue is stopped")]
    QueueStopped,

    /// The frontend factory could not create a handler.
    #[error("frontend handler error: {0}")]
    Handler(String),

    /// The store watch loop terminated with an error.
    #[error("store watch loop failed: {0}")]
    WatchLoopFailed(String),
}

/// Callback receiving errors from a background loop.
pub type ErrorCallback = Arc<dyn Fn(&BackendError) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_error_converts_transparently() {
        let err: BackendError = ControlPlaneError::from_errno("unmask", "12", 22).into();
        assert!(matches!(err, BackendError::ControlPlane(_)));
        assert!(err.to_string().starts_with("unmask failed for 12"));
    }

    #[test]
    fn test_protocol_violation_message_names_both_ports() {
        let err = BackendError::ProtocolViolation {
            expected: "port 12".to_string(),
            received: "port 5".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "protocol violation: expected port 12, received port 5"
        );
    }
}
