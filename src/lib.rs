// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]

//! # scale-ble
//!
//! A cross-platform Rust library for talking to wireless serial weighing
//! scales over Bluetooth Low Energy.
//!
//! The scale streams text weight frames over a serial-over-BLE bridge; this
//! library discovers nearby instruments, supervises one logical connection
//! with bounded retry, decodes the byte stream into weight readings and
//! sends the short command vocabulary (tare, zero, single read, start/stop
//! continuous reporting).
//!
//! ## Features
//!
//! - **Discovery**: scan for nearby instruments, ranked best-candidate first
//! - **Supervised connection**: bounded retry with fixed backoff, terminal
//!   errors the caller can act on
//! - **Streaming decode**: chunk-safe weight-frame parsing tolerant of
//!   partial frames and line noise
//! - **Commands**: tare, zero, single-read, continuous reporting control
//! - **One observable surface**: connection state, current weight, device
//!   list and last error published as one atomic snapshot
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scale_ble::{BleSerialTransport, ScaleManager, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = Arc::new(BleSerialTransport::new().await?);
//!     let manager = ScaleManager::new(transport);
//!
//!     manager.start_scan();
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let snapshot = manager.snapshot();
//!     if let Some(device) = snapshot.devices.first() {
//!         println!("Connecting to {}", device.display_name());
//!         manager.connect(device.address.clone());
//!     }
//!
//!     let mut updates = manager.subscribe();
//!     while updates.changed().await.is_ok() {
//!         if let Some(weight) = &updates.borrow().weight {
//!             println!("{} {} (stable: {})", weight.value, weight.unit, weight.stable);
//!         }
//!     }
//!
//!     manager.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod command;
pub mod decoder;
pub mod device;
pub mod error;
pub mod manager;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use ble::BleSerialTransport;
pub use error::{Error, Result};
pub use manager::{ManagerConfig, ScaleManager};

// Re-export commonly used types from submodules
pub use command::{Parity, SerialConfig};
pub use decoder::{DecoderConfig, FrameDecoder, WeightReading, WeightUnit};
pub use device::{DeviceCatalog, ScaleDevice};
pub use state::{ConnectionState, ScaleSnapshot};
pub use transport::{OpenFailure, Transport, TransportEvent};
