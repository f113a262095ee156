//! Error types for the scale-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Scanning or connecting was denied by the platform.
    #[error("Bluetooth permission denied: {operation}")]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Operation requires a connection but no channel is open.
    #[error("Scale not connected")]
    NotConnected,

    /// Writing a command to the open channel failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of why the write failed.
        reason: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
