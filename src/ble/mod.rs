//! BLE transport adapter.
//!
//! Implements the [`Transport`](crate::transport::Transport) seam on top of
//! btleplug, flattening platform callbacks into the ordered event stream the
//! connection supervisor consumes.

pub mod serial;
pub mod uuids;

pub use serial::BleSerialTransport;
