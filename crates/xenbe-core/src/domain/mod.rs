//! Domain entities for Xen backends.
//!
//! Pure data types with no I/O.  Everything here can be built and tested
//! without a hypervisor.

/// Domain and device identifiers.
pub mod ids;
/// Store path conventions.
pub mod paths;
/// Frontend/backend handshake states.
pub mod state;
