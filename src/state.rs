//! Externally observable state.
//!
//! Everything the UI and persistence layers may read is bundled into one
//! immutable [`ScaleSnapshot`] published atomically through a `watch`
//! channel, so a reader can never observe a torn combination such as
//! `Connected` paired with a stale error message.

use crate::decoder::WeightReading;
use crate::device::ScaleDevice;

/// Connection supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No channel open, no scan running.
    #[default]
    Disconnected,
    /// Discovery in progress.
    Scanning,
    /// Connect attempt (possibly a retry) in flight.
    Connecting,
    /// Channel open and streaming.
    Connected,
    /// Terminal failure; the caller must re-scan or re-pick.
    Error,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Immutable snapshot of everything observable about the scale link.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaleSnapshot {
    /// Current supervisor phase.
    pub connection: ConnectionState,
    /// Most recent decoded reading, if any.
    pub weight: Option<WeightReading>,
    /// Devices seen during the current scan, sorted best-candidate first.
    pub devices: Vec<ScaleDevice>,
    /// Display name of the connected device, if any.
    pub device_name: Option<String>,
    /// Last human-readable error or retry-progress message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Scanning), "Scanning");
    }

    #[test]
    fn test_default_snapshot() {
        let snapshot = ScaleSnapshot::default();
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert!(snapshot.weight.is_none());
        assert!(snapshot.devices.is_empty());
        assert!(snapshot.last_error.is_none());
    }
}
