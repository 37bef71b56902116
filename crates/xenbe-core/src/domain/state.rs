//! Frontend/backend handshake states.
//!
//! Each half of a split device publishes its progress as an integer in a
//! `state` store node.  The values follow the `xenbus_state` numbering:
//!
//! ```text
//! 0 Unknown  1 Initializing  2 InitWait  3 Initialized  4 Connected
//! 5 Closing  6 Closed        7 Reconfiguring            8 Reconfigured
//! ```
//!
//! A value outside that range is kept as [`ConnectionState::Unrecognized`]
//! instead of being truncated or rejected, so a misbehaving frontend can never
//! cause an out-of-bounds lookup.

use std::fmt;

/// State of one side of the frontend/backend handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unknown,
    Initializing,
    InitWait,
    Initialized,
    Connected,
    Closing,
    Closed,
    Reconfiguring,
    Reconfigured,
    /// The node held an integer outside the known range.
    Unrecognized(i64),
}

const LABELS: [&str; 9] = [
    "Unknown",
    "Initializing",
    "InitWait",
    "Initialized",
    "Connected",
    "Closing",
    "Closed",
    "Reconfiguring",
    "Reconfigured",
];

impl ConnectionState {
    /// Maps the raw integer stored in a `state` node.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Unknown,
            1 => Self::Initializing,
            2 => Self::InitWait,
            3 => Self::Initialized,
            4 => Self::Connected,
            5 => Self::Closing,
            6 => Self::Closed,
            7 => Self::Reconfiguring,
            8 => Self::Reconfigured,
            other => Self::Unrecognized(other),
        }
    }

    /// Parses the textual content of a `state` node.
    ///
    /// Returns `None` only when the text is not an integer at all.
    pub fn parse(text: &str) -> Option<Self> {
        text.trim().parse::<i64>().ok().map(Self::from_raw)
    }

    /// The integer written to the store for this state.
    pub fn as_raw(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Initializing => 1,
            Self::InitWait => 2,
            Self::Initialized => 3,
            Self::Connected => 4,
            Self::Closing => 5,
            Self::Closed => 6,
            Self::Reconfiguring => 7,
            Self::Reconfigured => 8,
            Self::Unrecognized(raw) => raw,
        }
    }

    /// The bare state name, or `None` for an unrecognized value.
    pub fn label(self) -> Option<&'static str> {
        match self {
            Self::Unrecognized(_) => None,
            known => LABELS.get(known.as_raw() as usize).copied(),
        }
    }

    pub fn is_recognized(self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    /// `true` for `Closing` and `Closed`.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => write!(f, "[{label}]"),
            None => write!(f, "Error!!! ({})", self.as_raw()),
        }
    }
}
