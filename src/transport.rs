//! Narrow seam over the radio transport.
//!
//! The platform SDK delivers discovery sightings, channel lifecycle and raw
//! data through callbacks; this trait flattens all of that into one ordered
//! event stream so the connection supervisor stays free of transport-specific
//! callback shapes and can be driven by synthetic events in tests.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;

/// Why an `open` attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    /// The attempt did not complete within the bounded timeout. Retriable.
    Timeout,
    /// Generic transport error. Retriable.
    Transport(String),
    /// The device does not expose the expected serial service. Not retriable.
    InvalidDevice,
    /// The platform denied the operation. Not retriable.
    PermissionDenied,
}

impl OpenFailure {
    /// Whether a bounded retry against the same address makes sense.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

impl std::fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "connection timed out"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::InvalidDevice => write!(f, "device does not speak the scale protocol"),
            Self::PermissionDenied => write!(f, "Bluetooth permission denied"),
        }
    }
}

/// Event delivered by a [`Transport`] implementation.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A device was sighted during scanning (first sighting or refresh).
    DeviceSighted {
        /// Transport address.
        address: String,
        /// Advertised local name, if any.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// A previously requested `open` completed and the channel is live.
    Opened {
        /// Address the channel was opened to.
        address: String,
    },
    /// A previously requested `open` failed.
    OpenFailed {
        /// Address the attempt targeted.
        address: String,
        /// Classified failure cause.
        failure: OpenFailure,
    },
    /// Raw bytes arrived on the open channel.
    Data {
        /// Address the bytes arrived from.
        address: String,
        /// The raw chunk.
        bytes: Vec<u8>,
    },
    /// The channel closed, whether device-initiated or in response to `close`.
    Closed {
        /// Address of the closed channel.
        address: String,
    },
}

/// Capability the supervisor needs from the radio: scan for devices, open or
/// close one logical serial channel to an address, and write raw bytes.
///
/// `open` is fire-and-forget; its outcome arrives as an [`TransportEvent::Opened`]
/// or [`TransportEvent::OpenFailed`] event on the stream returned by
/// [`events`](Transport::events).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin discovery. Sightings arrive as `DeviceSighted` events.
    async fn start_scan(&self) -> Result<()>;

    /// Cease discovery.
    async fn stop_scan(&self) -> Result<()>;

    /// Begin opening a logical serial channel to `address`, bounded by
    /// `timeout`.
    async fn open(&self, address: &str, timeout: Duration);

    /// Write raw bytes to the open channel.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Close the channel to `address`, best-effort.
    async fn close(&self, address: &str);

    /// Subscribe to the ordered event stream.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
