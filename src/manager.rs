//! Connection supervisor for a single wireless scale.
//!
//! [`ScaleManager`] owns one supervisor task that serializes every state
//! transition: caller requests, transport events and elapsed timers all land
//! in the same loop, so at most one connect/retry sequence is ever in flight
//! and the decoder backlog is only touched from one place.
//!
//! Delayed work (settle delays, retry backoff, the configuration handshake)
//! is a spawned task whose handle is retained, so `disconnect`, `destroy` or
//! a superseding `connect` can cancel it before it fires.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{
    self, SerialConfig, CMD_CONTINUOUS, CMD_READ_WEIGHT, CMD_STOP_CONTINUOUS, CMD_TARE, CMD_ZERO,
};
use crate::decoder::{DecoderConfig, FrameDecoder};
use crate::device::{DeviceCatalog, Sighting};
use crate::state::{ConnectionState, ScaleSnapshot};
use crate::transport::{Transport, TransportEvent};

/// Tunable timings and bounds for the supervisor.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pause between closing a stale channel and re-opening it.
    pub settle_delay: Duration,
    /// Bound on a single open attempt.
    pub connect_timeout: Duration,
    /// Fixed pause between failed connect attempts.
    pub retry_backoff: Duration,
    /// Pause after a successful connect before the handshake runs.
    pub handshake_delay: Duration,
    /// Pause between sending the serial configuration and starting the stream.
    pub config_apply_delay: Duration,
    /// Maximum connect attempts against one address before giving up.
    pub max_connect_attempts: u32,
    /// Serial-line parameters sent during the handshake.
    pub serial: SerialConfig,
    /// Frame decoder configuration.
    pub decoder: DecoderConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(1),
            handshake_delay: Duration::from_millis(500),
            config_apply_delay: Duration::from_millis(300),
            max_connect_attempts: 3,
            serial: SerialConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

/// Caller request placed on the supervisor mailbox.
enum Request {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    SendCommand(String),
    ClearError,
    Destroy,
}

/// Message a scheduled task sends back into the supervisor loop.
enum Internal {
    /// The retry backoff elapsed for the given attempt.
    RetryElapsed { address: String, attempt: u32 },
    /// A handshake write failed.
    HandshakeFailed(String),
}

/// In-flight reconnection bookkeeping. At most one exists at a time.
struct RetryContext {
    /// Target address of the pending connect.
    address: String,
    /// Failed attempts so far.
    attempts: u32,
}

/// Handle to a running scale supervisor.
///
/// All entry points enqueue onto the supervisor mailbox and return
/// immediately; outcomes are observed through the published
/// [`ScaleSnapshot`]. Expected failures (timeouts, write errors, denied
/// scans) never surface as panics or errors here, only as snapshot changes.
pub struct ScaleManager {
    request_tx: mpsc::UnboundedSender<Request>,
    snapshot_rx: watch::Receiver<ScaleSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScaleManager {
    /// Create a manager with default timings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    /// Create a manager with explicit timings and serial parameters.
    pub fn with_config(transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ScaleSnapshot::default());
        let events = transport.events();

        let decoder = FrameDecoder::with_config(config.decoder.clone());
        let supervisor = Supervisor {
            transport,
            config,
            snapshot_tx,
            internal_tx,
            catalog: DeviceCatalog::new(),
            decoder,
            snapshot: ScaleSnapshot::default(),
            retry: None,
            connected_address: None,
            dial_task: None,
            retry_task: None,
            handshake_task: None,
        };

        let task = tokio::spawn(supervisor.run(request_rx, internal_rx, events));

        Self {
            request_tx,
            snapshot_rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to atomically published state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ScaleSnapshot> {
        self.snapshot_rx.clone()
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> ScaleSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Clear prior scan results and request discovery.
    pub fn start_scan(&self) {
        self.send(Request::StartScan);
    }

    /// Request that discovery cease.
    pub fn stop_scan(&self) {
        self.send(Request::StopScan);
    }

    /// Connect to the scale at `address`, superseding any pending attempt.
    pub fn connect(&self, address: impl Into<String>) {
        self.send(Request::Connect(address.into()));
    }

    /// Cancel pending work and close the channel if one is open.
    pub fn disconnect(&self) {
        self.send(Request::Disconnect);
    }

    /// Send a raw command line (terminator appended) to the instrument.
    pub fn send_command(&self, command: impl Into<String>) {
        self.send(Request::SendCommand(command.into()));
    }

    /// Tare the scale.
    pub fn tare(&self) {
        self.send_command(CMD_TARE);
    }

    /// Zero the scale.
    pub fn zero(&self) {
        self.send_command(CMD_ZERO);
    }

    /// Request a single reading.
    pub fn request_weight(&self) {
        self.send_command(CMD_READ_WEIGHT);
    }

    /// Stop continuous reporting.
    pub fn stop_continuous_print(&self) {
        self.send_command(CMD_STOP_CONTINUOUS);
    }

    /// Clear the published error message. A terminal `Error` state reverts
    /// to `Disconnected`.
    pub fn clear_error(&self) {
        self.send(Request::ClearError);
    }

    /// Full teardown: cancel pending work, disconnect, stop scanning.
    /// Idempotent.
    pub async fn destroy(&self) {
        let _ = self.request_tx.send(Request::Destroy);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, request: Request) {
        if self.request_tx.send(request).is_err() {
            debug!("Request ignored, manager already destroyed");
        }
    }
}

impl Drop for ScaleManager {
    fn drop(&mut self) {
        // Unblocks the supervisor loop if destroy() was never called.
        let _ = self.request_tx.send(Request::Destroy);
    }
}

/// The supervisor task. Owns every piece of connection state.
struct Supervisor {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    snapshot_tx: watch::Sender<ScaleSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    catalog: DeviceCatalog,
    decoder: FrameDecoder,
    /// Working copy of the published snapshot.
    snapshot: ScaleSnapshot,
    retry: Option<RetryContext>,
    connected_address: Option<String>,
    dial_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    handshake_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) {
        debug!("Supervisor task started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Destroy) | None => {
                        self.teardown().await;
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} transport events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Transport event stream closed");
                        self.teardown().await;
                        break;
                    }
                },
            }
        }

        debug!("Supervisor task ended");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::StartScan => self.handle_start_scan().await,
            Request::StopScan => self.handle_stop_scan().await,
            Request::Connect(address) => self.handle_connect(address).await,
            Request::Disconnect => self.handle_disconnect().await,
            Request::SendCommand(text) => self.handle_send_command(text).await,
            Request::ClearError => self.handle_clear_error(),
            Request::Destroy => unreachable!("handled in run loop"),
        }
    }

    async fn handle_start_scan(&mut self) {
        self.catalog.clear();
        self.snapshot.devices.clear();

        match self.transport.start_scan().await {
            Ok(()) => {
                info!("Scan started");
                if !self.snapshot.connection.is_connected() {
                    self.snapshot.connection = ConnectionState::Scanning;
                }
                self.publish();
            }
            Err(e) => {
                // Denied discovery is terminal, retrying cannot change it.
                warn!("Scan refused: {}", e);
                self.snapshot.connection = ConnectionState::Error;
                self.snapshot.last_error = Some(e.to_string());
                self.publish();
            }
        }
    }

    async fn handle_stop_scan(&mut self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Stop scan failed: {}", e);
        }
        if self.snapshot.connection == ConnectionState::Scanning {
            self.snapshot.connection = ConnectionState::Disconnected;
            self.publish();
        }
    }

    async fn handle_connect(&mut self, address: String) {
        info!("Connect requested: {}", address);

        if self.snapshot.connection == ConnectionState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Stop scan before connect failed: {}", e);
            }
        }

        // A new connect supersedes any pending retry or handshake.
        self.cancel_scheduled();

        // The aborted dial may have half-opened a channel that was never
        // registered; close it at the transport level.
        if let Some(superseded) = self.retry.take() {
            if superseded.address != address {
                self.transport.close(&superseded.address).await;
            }
        }

        if let Some(old) = self.connected_address.take() {
            self.transport.close(&old).await;
            self.decoder.clear();
            self.snapshot.weight = None;
            self.snapshot.device_name = None;
        }

        self.retry = Some(RetryContext {
            address: address.clone(),
            attempts: 0,
        });
        self.snapshot.connection = ConnectionState::Connecting;
        self.snapshot.last_error = None;
        self.publish();

        self.spawn_dial(address);
    }

    async fn handle_disconnect(&mut self) {
        debug!("Disconnect requested");
        self.cancel_scheduled();
        let pending = self.retry.take();

        if let Some(address) = self.connected_address.clone() {
            // State transition follows from the resulting Closed event.
            self.transport.close(&address).await;
        } else if self.snapshot.connection == ConnectionState::Connecting {
            // The aborted dial may have half-opened the channel; close it.
            // Nothing is registered, so no close callback will arrive.
            if let Some(pending) = pending {
                self.transport.close(&pending.address).await;
            }
            self.snapshot.connection = ConnectionState::Disconnected;
            self.publish();
        }
    }

    async fn handle_send_command(&mut self, text: String) {
        if self.connected_address.is_none() {
            debug!("Dropping command {:?}, no open channel", text);
            self.snapshot.last_error = Some(format!("cannot send {text:?}: not connected"));
            self.publish();
            return;
        }

        if let Err(e) = self.transport.write(&command::frame(&text)).await {
            warn!("Write failed for {:?}: {}", text, e);
            self.snapshot.last_error = Some(format!("write failed: {e}"));
            self.publish();
        }
    }

    fn handle_clear_error(&mut self) {
        self.snapshot.last_error = None;
        if self.snapshot.connection == ConnectionState::Error {
            self.snapshot.connection = ConnectionState::Disconnected;
        }
        self.publish();
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::RetryElapsed { address, attempt } => {
                // Stale timers from a superseded attempt are inert.
                let current = self
                    .retry
                    .as_ref()
                    .filter(|r| r.address == address && r.attempts == attempt);
                if current.is_some() {
                    debug!("Retry backoff elapsed, re-dialing {}", address);
                    self.spawn_dial(address);
                }
            }
            Internal::HandshakeFailed(reason) => {
                // The channel may still serve manual reads, keep the state.
                warn!("Configuration handshake failed: {}", reason);
                self.snapshot.last_error = Some(reason);
                self.publish();
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceSighted {
                address,
                name,
                rssi,
            } => {
                self.snapshot.devices = self.catalog.upsert(Sighting {
                    address,
                    name,
                    rssi,
                });
                self.publish();
            }
            TransportEvent::Opened { address } => self.handle_opened(address).await,
            TransportEvent::OpenFailed { address, failure } => {
                self.handle_open_failed(address, failure)
            }
            TransportEvent::Data { address, bytes } => self.handle_data(address, &bytes),
            TransportEvent::Closed { address } => self.handle_closed(address),
        }
    }

    async fn handle_opened(&mut self, address: String) {
        let expected = self
            .retry
            .as_ref()
            .map(|r| r.address == address)
            .unwrap_or(false);

        if !expected {
            if self.connected_address.as_deref() != Some(address.as_str()) {
                // Late success from a superseded attempt, drop the channel.
                debug!("Closing unexpected channel to {}", address);
                self.transport.close(&address).await;
            }
            return;
        }

        info!("Connected to {}", address);
        self.retry = None;
        self.cancel_scheduled();
        self.decoder.clear();

        self.snapshot.device_name = Some(
            self.catalog
                .get(&address)
                .map(|d| d.display_name().to_string())
                .unwrap_or_else(|| address.clone()),
        );
        self.connected_address = Some(address);
        self.snapshot.connection = ConnectionState::Connected;
        self.snapshot.last_error = None;
        self.publish();

        self.spawn_handshake();
    }

    fn handle_open_failed(&mut self, address: String, failure: crate::transport::OpenFailure) {
        let Some(retry) = self.retry.as_mut() else {
            return;
        };
        if retry.address != address {
            return;
        }

        if !failure.is_retriable() {
            warn!("Connect to {} rejected: {}", address, failure);
            self.retry = None;
            self.snapshot.connection = ConnectionState::Error;
            self.snapshot.last_error = Some(failure.to_string());
            self.publish();
            return;
        }

        retry.attempts += 1;
        let attempts = retry.attempts;
        let max = self.config.max_connect_attempts;

        if attempts < max {
            info!(
                "Connect to {} failed ({}), retrying attempt {} of {}",
                address,
                failure,
                attempts + 1,
                max
            );
            self.snapshot.last_error =
                Some(format!("retrying attempt {} of {}", attempts + 1, max));
            self.publish();
            self.spawn_retry(address, attempts);
        } else {
            warn!("Connect to {} failed after {} attempts", address, max);
            self.retry = None;
            self.snapshot.connection = ConnectionState::Error;
            self.snapshot.last_error = Some(failure.to_string());
            self.publish();
        }
    }

    fn handle_data(&mut self, address: String, bytes: &[u8]) {
        if self.connected_address.as_deref() != Some(address.as_str()) {
            return;
        }

        for reading in self.decoder.feed(bytes) {
            self.snapshot.weight = Some(reading);
            self.publish();
        }
    }

    fn handle_closed(&mut self, address: String) {
        if self.connected_address.as_deref() != Some(address.as_str()) {
            return;
        }

        info!("Channel to {} closed", address);
        self.connected_address = None;
        if let Some(handle) = self.handshake_task.take() {
            handle.abort();
        }
        self.decoder.clear();
        self.snapshot.connection = ConnectionState::Disconnected;
        self.snapshot.weight = None;
        self.snapshot.device_name = None;
        self.publish();
    }

    /// Close any stale channel, wait out the settle delay, then open.
    fn spawn_dial(&mut self, address: String) {
        if let Some(handle) = self.dial_task.take() {
            handle.abort();
        }

        let transport = self.transport.clone();
        let settle = self.config.settle_delay;
        let timeout = self.config.connect_timeout;

        self.dial_task = Some(tokio::spawn(async move {
            transport.close(&address).await;
            tokio::time::sleep(settle).await;
            transport.open(&address, timeout).await;
        }));
    }

    /// Wait out the fixed backoff, then report back into the loop.
    fn spawn_retry(&mut self, address: String, attempt: u32) {
        if let Some(handle) = self.retry_task.take() {
            handle.abort();
        }

        let internal_tx = self.internal_tx.clone();
        let backoff = self.config.retry_backoff;

        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = internal_tx.send(Internal::RetryElapsed { address, attempt });
        }));
    }

    /// Send the serial configuration, let it apply, then start the stream.
    fn spawn_handshake(&mut self) {
        if let Some(handle) = self.handshake_task.take() {
            handle.abort();
        }

        let transport = self.transport.clone();
        let internal_tx = self.internal_tx.clone();
        let serial_line = self.config.serial.command_line();
        let settle = self.config.handshake_delay;
        let apply = self.config.config_apply_delay;

        self.handshake_task = Some(tokio::spawn(async move {
            tokio::time::sleep(settle).await;

            if let Err(e) = transport.write(&command::frame(&serial_line)).await {
                let _ = internal_tx.send(Internal::HandshakeFailed(format!(
                    "serial configuration failed: {e}"
                )));
                return;
            }

            tokio::time::sleep(apply).await;

            if let Err(e) = transport.write(&command::frame(CMD_CONTINUOUS)).await {
                let _ = internal_tx.send(Internal::HandshakeFailed(format!(
                    "could not start continuous reporting: {e}"
                )));
            }
        }));
    }

    /// Abort every scheduled task so a late timer cannot resurrect a
    /// connection the caller believes is closed.
    fn cancel_scheduled(&mut self) {
        for handle in [
            self.dial_task.take(),
            self.retry_task.take(),
            self.handshake_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    async fn teardown(&mut self) {
        info!("Supervisor teardown");
        self.cancel_scheduled();

        if let Some(pending) = self.retry.take() {
            self.transport.close(&pending.address).await;
        }
        if let Some(address) = self.connected_address.take() {
            self.transport.close(&address).await;
        }
        if let Err(e) = self.transport.stop_scan().await {
            debug!("Stop scan during teardown failed: {}", e);
        }

        self.decoder.clear();
        self.snapshot = ScaleSnapshot::default();
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::OpenFailure;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted in-memory transport driving the supervisor with synthetic
    /// events.
    struct MockTransport {
        event_tx: broadcast::Sender<TransportEvent>,
        /// Outcome script for successive open calls; empty means succeed.
        open_script: Mutex<VecDeque<Option<OpenFailure>>>,
        open_calls: Mutex<Vec<String>>,
        close_calls: Mutex<Vec<String>>,
        writes: Mutex<Vec<Vec<u8>>>,
        open_channel: Mutex<Option<String>>,
        scan_denied: bool,
        fail_writes: bool,
        scan_count: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(64);
            Arc::new(Self {
                event_tx,
                open_script: Mutex::new(VecDeque::new()),
                open_calls: Mutex::new(Vec::new()),
                close_calls: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                open_channel: Mutex::new(None),
                scan_denied: false,
                fail_writes: false,
                scan_count: AtomicUsize::new(0),
            })
        }

        fn with_scan_denied() -> Arc<Self> {
            let mut mock = Self::new();
            Arc::get_mut(&mut mock).unwrap().scan_denied = true;
            mock
        }

        fn with_failing_writes() -> Arc<Self> {
            let mut mock = Self::new();
            Arc::get_mut(&mut mock).unwrap().fail_writes = true;
            mock
        }

        fn script_opens(&self, outcomes: impl IntoIterator<Item = Option<OpenFailure>>) {
            self.open_script.lock().extend(outcomes);
        }

        fn inject(&self, event: TransportEvent) {
            let _ = self.event_tx.send(event);
        }

        fn sight(&self, address: &str, name: Option<&str>, rssi: i16) {
            self.inject(TransportEvent::DeviceSighted {
                address: address.to_string(),
                name: name.map(|n| n.to_string()),
                rssi: Some(rssi),
            });
        }

        fn data(&self, address: &str, bytes: &[u8]) {
            self.inject(TransportEvent::Data {
                address: address.to_string(),
                bytes: bytes.to_vec(),
            });
        }

        fn open_count(&self) -> usize {
            self.open_calls.lock().len()
        }

        fn closes_to(&self, address: &str) -> usize {
            self.close_calls
                .lock()
                .iter()
                .filter(|a| a.as_str() == address)
                .count()
        }

        fn written_lines(&self) -> Vec<String> {
            self.writes
                .lock()
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn start_scan(&self) -> crate::error::Result<()> {
            self.scan_count.fetch_add(1, Ordering::SeqCst);
            if self.scan_denied {
                return Err(Error::PermissionDenied {
                    operation: "scan".to_string(),
                });
            }
            Ok(())
        }

        async fn stop_scan(&self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn open(&self, address: &str, _timeout: Duration) {
            self.open_calls.lock().push(address.to_string());
            let outcome = self.open_script.lock().pop_front().unwrap_or(None);
            match outcome {
                None => {
                    *self.open_channel.lock() = Some(address.to_string());
                    self.inject(TransportEvent::Opened {
                        address: address.to_string(),
                    });
                }
                Some(failure) => {
                    self.inject(TransportEvent::OpenFailed {
                        address: address.to_string(),
                        failure,
                    });
                }
            }
        }

        async fn write(&self, bytes: &[u8]) -> crate::error::Result<()> {
            if self.fail_writes {
                return Err(Error::WriteFailed {
                    reason: "mock write failure".to_string(),
                });
            }
            self.writes.lock().push(bytes.to_vec());
            Ok(())
        }

        async fn close(&self, address: &str) {
            self.close_calls.lock().push(address.to_string());
            let mut channel = self.open_channel.lock();
            if channel.as_deref() == Some(address) {
                *channel = None;
                self.inject(TransportEvent::Closed {
                    address: address.to_string(),
                });
            }
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.event_tx.subscribe()
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            settle_delay: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(5),
            handshake_delay: Duration::from_millis(2),
            config_apply_delay: Duration::from_millis(2),
            ..ManagerConfig::default()
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ScaleSnapshot>,
        what: &str,
        predicate: impl Fn(&ScaleSnapshot) -> bool,
    ) -> ScaleSnapshot {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let snapshot = rx.borrow();
                    if predicate(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.expect("supervisor task gone");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<ScaleSnapshot>,
        state: ConnectionState,
    ) -> ScaleSnapshot {
        wait_for(rx, &format!("state {state}"), |s| s.connection == state).await
    }

    #[tokio::test]
    async fn test_connect_success_first_attempt() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        let snapshot = wait_for_state(&mut rx, ConnectionState::Connected).await;

        assert_eq!(mock.open_count(), 1);
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.device_name.as_deref(), Some("aa:bb"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_retry_twice_then_succeed() {
        let mock = MockTransport::new();
        mock.script_opens([
            Some(OpenFailure::Timeout),
            Some(OpenFailure::Transport("reset".into())),
            None,
        ]);
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        let snapshot = wait_for_state(&mut rx, ConnectionState::Connected).await;

        assert_eq!(mock.open_count(), 3);
        assert!(snapshot.last_error.is_none());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_retry_progress_message() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout), None]);
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        let snapshot = wait_for(&mut rx, "retry message", |s| s.last_error.is_some()).await;
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("retrying attempt 2 of 3")
        );
        assert_eq!(snapshot.connection, ConnectionState::Connecting);

        wait_for_state(&mut rx, ConnectionState::Connected).await;
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_three_failures_terminal_error() {
        let mock = MockTransport::new();
        mock.script_opens([
            Some(OpenFailure::Timeout),
            Some(OpenFailure::Timeout),
            Some(OpenFailure::Timeout),
        ]);
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        let snapshot = wait_for_state(&mut rx, ConnectionState::Error).await;
        assert_eq!(snapshot.last_error.as_deref(), Some("connection timed out"));
        assert_eq!(mock.open_count(), 3);

        // The bound is exhausted, no further automatic attempt fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.open_count(), 3);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_invalid_device_no_retry() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::InvalidDevice)]);
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        let snapshot = wait_for_state(&mut rx, ConnectionState::Error).await;
        assert_eq!(mock.open_count(), 1);
        assert!(snapshot
            .last_error
            .as_deref()
            .unwrap()
            .contains("does not speak"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.open_count(), 1);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_new_connect_supersedes_pending_retry() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout), None]);
        let config = ManagerConfig {
            // Long backoff so the addr-a retry is still pending when
            // connect(addr-b) arrives.
            retry_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ScaleManager::with_config(mock.clone(), config);
        let mut rx = manager.subscribe();

        manager.connect("addr-a");
        wait_for(&mut rx, "first failure", |s| s.last_error.is_some()).await;

        manager.connect("addr-b");
        let snapshot = wait_for_state(&mut rx, ConnectionState::Connected).await;
        assert_eq!(snapshot.device_name.as_deref(), Some("addr-b"));
        assert_eq!(mock.open_calls.lock().as_slice(), ["addr-a", "addr-b"]);

        // A late success callback for addr-a must not alter state; the
        // unwanted channel is closed instead.
        mock.inject(TransportEvent::Opened {
            address: "addr-a".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert_eq!(snapshot.device_name.as_deref(), Some("addr-b"));
        assert!(mock
            .close_calls
            .lock()
            .iter()
            .any(|a| a == "addr-a"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_cancels_retry() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout)]);
        let config = ManagerConfig {
            retry_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ScaleManager::with_config(mock.clone(), config);
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for(&mut rx, "first failure", |s| s.last_error.is_some()).await;

        manager.disconnect();
        let snapshot = wait_for_state(&mut rx, ConnectionState::Disconnected).await;
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.open_count(), 1);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_closes_pending_dial() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout)]);
        let config = ManagerConfig {
            retry_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ScaleManager::with_config(mock.clone(), config);
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for(&mut rx, "first failure", |s| s.last_error.is_some()).await;
        // One close so far, from the dial prologue.
        assert_eq!(mock.closes_to("aa:bb"), 1);

        manager.disconnect();
        wait_for_state(&mut rx, ConnectionState::Disconnected).await;

        // The abandoned attempt is closed at the transport level so a
        // half-open radio connection cannot outlive the dial.
        assert_eq!(mock.closes_to("aa:bb"), 2);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_superseding_connect_closes_stale_dial() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout), None]);
        let config = ManagerConfig {
            retry_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ScaleManager::with_config(mock.clone(), config);
        let mut rx = manager.subscribe();

        manager.connect("addr-a");
        wait_for(&mut rx, "first failure", |s| s.last_error.is_some()).await;
        assert_eq!(mock.closes_to("addr-a"), 1);

        manager.connect("addr-b");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        assert_eq!(mock.closes_to("addr-a"), 2);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_while_connecting_closes_pending_dial() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::Timeout)]);
        let config = ManagerConfig {
            retry_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ScaleManager::with_config(mock.clone(), config);
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for(&mut rx, "first failure", |s| s.last_error.is_some()).await;
        assert_eq!(mock.closes_to("aa:bb"), 1);

        manager.destroy().await;
        assert_eq!(mock.closes_to("aa:bb"), 2);
    }

    #[tokio::test]
    async fn test_handshake_sends_config_then_continuous() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lines = mock.written_lines();
        assert_eq!(lines, vec!["COM 9600,8,1,N\r\n", "CP\r\n"]);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_keeps_connection() {
        let mock = MockTransport::with_failing_writes();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let snapshot = wait_for(&mut rx, "handshake error", |s| s.last_error.is_some()).await;

        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert!(snapshot
            .last_error
            .as_deref()
            .unwrap()
            .contains("serial configuration failed"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_streamed_weight_updates_snapshot() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        mock.data("aa:bb", b"  15.06 kg\r\n");
        let snapshot = wait_for(&mut rx, "weight", |s| s.weight.is_some()).await;
        let weight = snapshot.weight.unwrap();
        assert!((weight.value - 15.06).abs() < f64::EPSILON);
        assert!(weight.stable);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_chunked_stream_across_data_events() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        mock.data("aa:bb", b"3.2 g");
        mock.data("aa:bb", b" ?\r\n");
        let snapshot = wait_for(&mut rx, "weight", |s| s.weight.is_some()).await;
        let weight = snapshot.weight.unwrap();
        assert!((weight.value - 3.2).abs() < f64::EPSILON);
        assert!(!weight.stable);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_data_from_other_address_ignored() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        mock.data("cc:dd", b"99.9 kg\r\n");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.snapshot().weight.is_none());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_external_disconnect_clears_transient_state() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        mock.data("aa:bb", b"1.0 kg\r\n");
        wait_for(&mut rx, "weight", |s| s.weight.is_some()).await;

        // Device-initiated disconnect.
        mock.inject(TransportEvent::Closed {
            address: "aa:bb".to_string(),
        });
        let snapshot = wait_for_state(&mut rx, ConnectionState::Disconnected).await;
        assert!(snapshot.weight.is_none());
        assert!(snapshot.device_name.is_none());

        // No automatic reconnect.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mock.open_count(), 1);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_command_without_channel_sets_error_only() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.tare();
        let snapshot = wait_for(&mut rx, "error message", |s| s.last_error.is_some()).await;
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert!(snapshot.last_error.as_deref().unwrap().contains("not connected"));
        assert!(mock.written_lines().is_empty());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_named_commands_framed_with_crlf() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.tare();
        manager.zero();
        manager.request_weight();
        manager.stop_continuous_print();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lines = mock.written_lines();
        // Handshake writes come first.
        assert_eq!(
            &lines[2..],
            ["T\r\n", "Z\r\n", "IP\r\n", "SCP\r\n"]
        );
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_scan_publishes_sorted_devices() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.start_scan();
        wait_for_state(&mut rx, ConnectionState::Scanning).await;

        mock.sight("aa", Some("Headphones"), -30);
        mock.sight("bb", Some("Kitchen Scale"), -70);
        let snapshot = wait_for(&mut rx, "two devices", |s| s.devices.len() == 2).await;
        assert_eq!(snapshot.devices[0].address, "bb");

        // Repeat sighting updates in place and re-sorts, no duplicate.
        mock.sight("bb", Some("Kitchen Scale"), -20);
        let snapshot = wait_for(&mut rx, "rssi refresh", |s| {
            s.devices.len() == 2 && s.devices[0].rssi == Some(-20)
        })
        .await;
        assert_eq!(snapshot.devices[0].address, "bb");

        manager.stop_scan();
        wait_for_state(&mut rx, ConnectionState::Disconnected).await;
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_new_scan_clears_previous_results() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.start_scan();
        wait_for_state(&mut rx, ConnectionState::Scanning).await;
        mock.sight("aa", Some("Scale"), -40);
        wait_for(&mut rx, "one device", |s| s.devices.len() == 1).await;

        manager.start_scan();
        let snapshot = wait_for(&mut rx, "cleared list", |s| s.devices.is_empty()).await;
        assert_eq!(snapshot.connection, ConnectionState::Scanning);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_scan_permission_denied_is_terminal() {
        let mock = MockTransport::with_scan_denied();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.start_scan();
        let snapshot = wait_for_state(&mut rx, ConnectionState::Error).await;
        assert!(snapshot
            .last_error
            .as_deref()
            .unwrap()
            .contains("permission denied"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_clear_error_returns_to_disconnected() {
        let mock = MockTransport::new();
        mock.script_opens([Some(OpenFailure::InvalidDevice)]);
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Error).await;

        manager.clear_error();
        let snapshot = wait_for_state(&mut rx, ConnectionState::Disconnected).await;
        assert!(snapshot.last_error.is_none());
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_idempotent() {
        let mock = MockTransport::new();
        let manager = ScaleManager::with_config(mock.clone(), fast_config());
        let mut rx = manager.subscribe();

        manager.connect("aa:bb");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        manager.destroy().await;
        manager.destroy().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert!(mock.close_calls.lock().iter().any(|a| a == "aa:bb"));
    }
}
