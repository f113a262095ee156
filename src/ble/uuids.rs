//! BLE Service and Characteristic UUIDs.
//!
//! The scale's radio bridge exposes a Nordic UART Service (NUS) pair of
//! characteristics carrying the serial byte stream.

use uuid::Uuid;

/// Nordic UART Service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (write to the scale).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (notifications from the scale).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Check if a service UUID is the serial bridge service.
pub fn is_serial_service(uuid: &Uuid) -> bool {
    *uuid == UART_SERVICE_UUID
}
