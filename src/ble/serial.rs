//! btleplug-backed serial channel to the scale.
//!
//! Converts btleplug central events and UART notifications into
//! [`TransportEvent`]s on a single ordered channel. At most one logical
//! channel is open at a time; opening classifies failures so the supervisor
//! can tell retriable link trouble from a terminal rejection.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::uuids::{is_serial_service, UART_RX_UUID, UART_TX_UUID};
use crate::error::{Error, Result};
use crate::transport::{OpenFailure, Transport, TransportEvent};

/// The open logical channel, if any.
struct OpenChannel {
    address: String,
    peripheral: Peripheral,
    rx_char: Characteristic,
}

/// BLE implementation of the scale transport.
pub struct BleSerialTransport {
    /// The BLE adapter used for scanning and connecting.
    adapter: Adapter,
    /// Single ordered event stream consumed by the supervisor.
    event_tx: broadcast::Sender<TransportEvent>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Handle to the scan event loop.
    scan_task: RwLock<Option<JoinHandle<()>>>,
    /// The open channel, shared with the scan loop for disconnect detection.
    open: Arc<RwLock<Option<OpenChannel>>>,
    /// Handle to the notification forwarder.
    notify_task: RwLock<Option<JoinHandle<()>>>,
}

impl BleSerialTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(128);

        Self {
            adapter,
            event_tx,
            is_scanning: Arc::new(RwLock::new(false)),
            scan_task: RwLock::new(None),
            open: Arc::new(RwLock::new(None)),
            notify_task: RwLock::new(None),
        }
    }

    /// Locate a peripheral by its identifier string.
    async fn find_peripheral(&self, address: &str) -> std::result::Result<Peripheral, OpenFailure> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| OpenFailure::Transport(e.to_string()))?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| OpenFailure::Transport(format!("device {address} not in range")))
    }

    /// Connect, resolve the UART characteristics and start forwarding
    /// notifications. Runs inside the caller's open timeout.
    async fn try_open(&self, address: &str) -> std::result::Result<(), OpenFailure> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral.connect().await.map_err(classify_connect)?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| OpenFailure::Transport(e.to_string()))?;

        // A device without the UART service is not a scale; disconnecting
        // and retrying cannot change that.
        let uart = peripheral
            .services()
            .into_iter()
            .find(|s| is_serial_service(&s.uuid));
        let Some(uart) = uart else {
            debug!("No UART service on {}, rejecting", address);
            let _ = peripheral.disconnect().await;
            return Err(OpenFailure::InvalidDevice);
        };

        let rx_char = uart
            .characteristics
            .iter()
            .find(|c| c.uuid == UART_RX_UUID)
            .cloned();
        let tx_char = uart
            .characteristics
            .iter()
            .find(|c| c.uuid == UART_TX_UUID)
            .cloned();
        let (Some(rx_char), Some(tx_char)) = (rx_char, tx_char) else {
            let _ = peripheral.disconnect().await;
            return Err(OpenFailure::InvalidDevice);
        };

        peripheral
            .subscribe(&tx_char)
            .await
            .map_err(|e| OpenFailure::Transport(e.to_string()))?;

        self.spawn_notify_forwarder(address.to_string(), peripheral.clone());

        *self.open.write() = Some(OpenChannel {
            address: address.to_string(),
            peripheral,
            rx_char,
        });

        Ok(())
    }

    /// Forward UART TX notifications as `Data` events.
    fn spawn_notify_forwarder(&self, address: String, peripheral: Peripheral) {
        if let Some(handle) = self.notify_task.write().take() {
            handle.abort();
        }

        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                if notification.uuid != UART_TX_UUID {
                    continue;
                }
                trace!(
                    "UART notification: {} bytes from {}",
                    notification.value.len(),
                    address
                );
                let _ = event_tx.send(TransportEvent::Data {
                    address: address.clone(),
                    bytes: notification.value,
                });
            }

            debug!("Notification forwarder ended for {}", address);
        });

        *self.notify_task.write() = Some(handle);
    }

    /// Tear down the open channel and emit `Closed` exactly once.
    ///
    /// Returns whether a registered channel matched the address.
    async fn close_open_channel(&self, address: &str) -> bool {
        let channel = {
            let mut open = self.open.write();
            match open.as_ref() {
                Some(c) if c.address == address => open.take(),
                _ => None,
            }
        };

        let Some(channel) = channel else {
            return false;
        };

        if let Some(handle) = self.notify_task.write().take() {
            handle.abort();
        }

        if let Err(e) = channel.peripheral.disconnect().await {
            debug!("Disconnect from {} failed: {}", address, e);
        }

        let _ = self.event_tx.send(TransportEvent::Closed {
            address: address.to_string(),
        });

        true
    }

    /// Convert one central event into transport events.
    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        open: &Arc<RwLock<Option<OpenChannel>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return;
                    }
                };

                let properties = match peripheral.properties().await {
                    Ok(Some(p)) => p,
                    _ => return,
                };

                let _ = event_tx.send(TransportEvent::DeviceSighted {
                    address: id.to_string(),
                    name: properties.local_name,
                    rssi: properties.rssi,
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = id.to_string();
                let was_open = {
                    let mut guard = open.write();
                    match guard.as_ref() {
                        Some(c) if c.address == address => {
                            guard.take();
                            true
                        }
                        _ => false,
                    }
                };
                if was_open {
                    info!("Device-initiated disconnect from {}", address);
                    let _ = event_tx.send(TransportEvent::Closed { address });
                }
            }
            _ => {}
        }
    }
}

/// Classify a btleplug connect error into an open failure.
fn classify_connect(error: btleplug::Error) -> OpenFailure {
    match error {
        btleplug::Error::TimedOut(_) => OpenFailure::Timeout,
        btleplug::Error::PermissionDenied => OpenFailure::PermissionDenied,
        other => OpenFailure::Transport(other.to_string()),
    }
}

#[async_trait]
impl Transport for BleSerialTransport {
    async fn start_scan(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan");

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| match e {
                btleplug::Error::PermissionDenied => Error::PermissionDenied {
                    operation: "scan".to_string(),
                },
                other => Error::Bluetooth(other),
            })?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let open = self.open.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        Self::handle_central_event(event, &adapter, &open, &event_tx).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if !*is_scanning.read() {
                            break;
                        }
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_task.write() = Some(handle);

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            return Ok(());
        }

        info!("Stopping BLE scan");
        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_task.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    async fn open(&self, address: &str, timeout: Duration) {
        debug!("Opening channel to {} (timeout {:?})", address, timeout);

        let outcome = tokio::time::timeout(timeout, self.try_open(address)).await;

        let event = match outcome {
            Ok(Ok(())) => {
                info!("Channel to {} open", address);
                TransportEvent::Opened {
                    address: address.to_string(),
                }
            }
            Ok(Err(failure)) => {
                warn!("Open to {} failed: {}", address, failure);
                TransportEvent::OpenFailed {
                    address: address.to_string(),
                    failure,
                }
            }
            Err(_) => {
                warn!("Open to {} timed out", address);
                // Abandon whatever the half-finished attempt left behind.
                if let Ok(peripheral) = self.find_peripheral(address).await {
                    let _ = peripheral.disconnect().await;
                }
                TransportEvent::OpenFailed {
                    address: address.to_string(),
                    failure: OpenFailure::Timeout,
                }
            }
        };

        let _ = self.event_tx.send(event);
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let (peripheral, rx_char) = {
            let open = self.open.read();
            let Some(channel) = open.as_ref() else {
                return Err(Error::NotConnected);
            };
            (channel.peripheral.clone(), channel.rx_char.clone())
        };

        peripheral
            .write(&rx_char, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| Error::WriteFailed {
                reason: e.to_string(),
            })?;

        trace!("Wrote {} bytes", bytes.len());
        Ok(())
    }

    async fn close(&self, address: &str) {
        if !self.close_open_channel(address).await {
            // A cancelled open can leave the peripheral connected before any
            // channel was registered; disconnect it at the radio level. No
            // `Closed` is emitted since no `Opened` was ever observed.
            if let Ok(peripheral) = self.find_peripheral(address).await {
                let _ = peripheral.disconnect().await;
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BleSerialTransport {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
