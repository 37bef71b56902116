//! Domain and device identifiers.
//!
//! A domain id names a guest while it is alive and is reused after the guest
//! is destroyed, so it is never treated as globally unique across time.  A
//! device id is only unique within one (domain, device class) pair.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a store directory entry is not a valid identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} identifier: {value:?}")]
pub struct IdParseError {
    kind: &'static str,
    value: String,
}

/// Identifier of a guest domain (`domid_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The control domain.
    pub const DOM0: DomainId = DomainId(0);

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DomainId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u16>().map(DomainId).map_err(|_| IdParseError {
            kind: "domain",
            value: s.to_string(),
        })
    }
}

/// Identifier of a device instance within one domain and device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u16);

impl DeviceId {
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u16>().map(DeviceId).map_err(|_| IdParseError {
            kind: "device",
            value: s.to_string(),
        })
    }
}

/// A (domain, device) pair identifying one frontend.
///
/// `Display` renders the `Dom(<dom>/<dev>)` label used as a log prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrontendKey {
    pub domain: DomainId,
    pub device: DeviceId,
}

impl FrontendKey {
    pub fn new(domain: DomainId, device: DeviceId) -> Self {
        Self { domain, device }
    }
}

impl fmt::Display for FrontendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dom({}/{})", self.domain, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_id_parses_directory_entry() {
        assert_eq!("7".parse::<DomainId>(), Ok(DomainId(7)));
        assert_eq!(" 12\n".parse::<DomainId>(), Ok(DomainId(12)));
    }

    #[test]
    fn test_domain_id_rejects_non_numeric_entry() {
        let err = "tools".parse::<DomainId>().unwrap_err();
        assert_eq!(err.to_string(), "invalid domain identifier: \"tools\"");
    }

    #[test]
    fn test_domain_id_rejects_out_of_range_value() {
        assert!("70000".parse::<DomainId>().is_err());
        assert!("-1".parse::<DomainId>().is_err());
    }

    #[test]
    fn test_device_id_parses_directory_entry() {
        assert_eq!("0".parse::<DeviceId>(), Ok(DeviceId(0)));
        assert!("".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_frontend_key_display_uses_dom_label() {
        let key = FrontendKey::new(DomainId(3), DeviceId(0));
        assert_eq!(key.to_string(), "Dom(3/0)");
    }

    #[test]
    fn test_frontend_keys_order_by_domain_then_device() {
        let mut keys = vec![
            FrontendKey::new(DomainId(7), DeviceId(0)),
            FrontendKey::new(DomainId(3), DeviceId(1)),
            FrontendKey::new(DomainId(3), DeviceId(0)),
        ];
        keys.sort();
        assert_eq!(keys[0], FrontendKey::new(DomainId(3), DeviceId(0)));
        assert_eq!(keys[2], FrontendKey::new(DomainId(7), DeviceId(0)));
    }
}
