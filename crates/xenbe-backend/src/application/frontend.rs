//! The device-handler capability and the per-frontend record it is built from.
//!
//! A concrete backend (network, block, input, ...) implements
//! [`FrontendFactory`].  The discovery engine calls
//! [`FrontendFactory::create`] once for every frontend device it decides to
//! serve, and is the sole owner of the returned handler until the device, its
//! domain, or the engine goes away.

use xenbe_core::domain::paths;
use xenbe_core::{ConnectionState, DeviceId, DomainId, FrontendKey};

use crate::error::BackendError;
use crate::infrastructure::store::StoreClient;

/// One served frontend device.
///
/// All methods have no-op defaults so a minimal handler is an empty `impl`.
pub trait FrontendHandler: Send + Sync {
    /// The frontend published a new state.  Called on the store watch thread.
    fn on_frontend_state_changed(&self, _state: ConnectionState) {}

    /// A terminated handler is released by the engine; a new one is created
    /// if the frontend later re-enters `Initializing`.
    fn is_terminated(&self) -> bool {
        false
    }

    /// Called once, after the handler's state watch has been cleared and
    /// after any state callback already running on it has returned.  The
    /// engine drops the handler right after.
    fn on_removed(&self) {}
}

/// Creates handlers for newly discovered frontends.
pub trait FrontendFactory: Send + Sync {
    /// # Errors
    ///
    /// A failure is logged by the engine; the device is retried the next
    /// time its frontend enters `Initializing`.
    fn create(&self, frontend: &FrontendRecord) -> Result<Box<dyn FrontendHandler>, BackendError>;
}

impl<F> FrontendFactory for F
where
    F: Fn(&FrontendRecord) -> Result<Box<dyn FrontendHandler>, BackendError> + Send + Sync,
{
    fn create(&self, frontend: &FrontendRecord) -> Result<Box<dyn FrontendHandler>, BackendError> {
        self(frontend)
    }
}

/// What a handler knows about the device it serves.
#[derive(Debug, Clone)]
pub struct FrontendRecord {
    device_class: String,
    key: FrontendKey,
    device_path: String,
    store: StoreClient,
}

impl FrontendRecord {
    pub fn new(
        device_class: impl Into<String>,
        key: FrontendKey,
        device_path: impl Into<String>,
        store: StoreClient,
    ) -> Self {
        Self {
            device_class: device_class.into(),
            key,
            device_path: device_path.into(),
            store,
        }
    }

    pub fn device_class(&self) -> &str {
        &self.device_class
    }

    pub fn domain_id(&self) -> DomainId {
        self.key.domain
    }

    pub fn device_id(&self) -> DeviceId {
        self.key.device
    }

    pub fn key(&self) -> FrontendKey {
        self.key
    }

    /// Frontend device directory, e.g. `/local/domain/3/device/vif/0`.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn state_path(&self) -> String {
        paths::state_path(&self.device_path)
    }

    /// Store connection shared with the engine.
    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// Reads the frontend's current state.  An absent node reads as
    /// [`ConnectionState::Unknown`].
    pub fn connection_state(&self) -> Result<ConnectionState, BackendError> {
        Ok(self
            .store
            .read_state(&self.state_path())?
            .unwrap_or(ConnectionState::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenbe_core::control::mock::MockControlPlane;

    struct Inert;
    impl FrontendHandler for Inert {}

    fn record(plane: &MockControlPlane) -> FrontendRecord {
        let key = FrontendKey::new(DomainId(3), DeviceId(0));
        let path = MockControlPlane::frontend_path_of(key.domain, "vif", key.device);
        FrontendRecord::new("vif", key, path, StoreClient::open(plane).unwrap())
    }

    #[test]
    fn test_record_exposes_identity() {
        let plane = MockControlPlane::new();

        let record = record(&plane);

        assert_eq!(record.device_class(), "vif");
        assert_eq!(record.domain_id(), DomainId(3));
        assert_eq!(record.device_id(), DeviceId(0));
        assert_eq!(record.state_path(), "/local/domain/3/device/vif/0/state");
    }

    #[test]
    fn test_connection_state_reads_current_node() {
        // Arrange
        let plane = MockControlPlane::new();
        let record = record(&plane);
        assert_eq!(record.connection_state().unwrap(), ConnectionState::Unknown);

        // Act
        plane.add_frontend(DomainId(3), "vif", DeviceId(0), ConnectionState::Connected);

        // Assert
        assert_eq!(record.connection_state().unwrap(), ConnectionState::Connected);
    }

    #[test]
    fn test_connection_state_keeps_unrecognized_marker() {
        let plane = MockControlPlane::new();
        let record = record(&plane);

        plane.write(&record.state_path(), "99");

        assert_eq!(
            record.connection_state().unwrap(),
            ConnectionState::Unrecognized(99)
        );
    }

    #[test]
    fn test_closure_acts_as_factory() {
        let plane = MockControlPlane::new();
        let factory = |_: &FrontendRecord| -> Result<Box<dyn FrontendHandler>, BackendError> {
            Ok(Box::new(Inert))
        };

        let handler = factory.create(&record(&plane)).unwrap();

        assert!(!handler.is_terminated());
    }
}
