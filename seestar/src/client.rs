//! Seestar control-channel client
//!
//! This module owns the connection lifecycle:
//! - UDP discovery probe, TCP connect and the signed-challenge handshake
//! - A writer task fed by an mpsc channel, and a receive loop that resolves
//!   pending commands and turns everything else into events
//! - A keepalive heartbeat
//! - Bounded auto-reconnect when the receive loop loses the stream
//! - The send-and-await primitive the command catalog is built on
//!
//! The catalog itself lives in the facet modules (`mount`, `focuser`,
//! `camera`, `images`, `system`) as further `impl SeestarClient` blocks.

use crate::auth;
use crate::coords::ObserverLocation;
use crate::correlation::PendingTable;
use crate::error::{SeestarError, SeestarResult};
use crate::events::{
    self, DeviceEvent, EventDispatcher, EventKind, ProgressCallback, SubscriptionId,
};
use crate::protocol::{self, methods, CommandRequest, DeviceMessage};
use crate::reconnect::{ReconnectDecision, ReconnectTracker};
use crate::status::{OperationStage, SeestarStatus, StatusModel};
use crate::transport;
use crate::{DeviceConfig, SeestarConfig};
use futures::future::BoxFuture;
use rsa::RsaPrivateKey;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Outgoing line queue depth
const WRITE_QUEUE_DEPTH: usize = 100;

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Handshake gate for one physical connection
#[derive(Default)]
struct Link {
    generation: u64,
    /// Authentication finished; a lost stream now triggers auto-reconnect
    established: bool,
    /// The receive loop already saw the stream end
    lost: bool,
}

impl Tasks {
    fn abort_all(self) {
        for handle in [self.reader, self.writer, self.heartbeat].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Shared connection state behind every `SeestarClient` handle
pub(crate) struct Inner {
    pub(crate) config: SeestarConfig,
    pub(crate) pending: PendingTable,
    pub(crate) events: EventDispatcher,
    pub(crate) status: StatusModel,
    observer_location: RwLock<Option<ObserverLocation>>,
    endpoint: RwLock<Option<(String, u16)>>,
    connected: AtomicBool,
    /// Identity of the current physical connection; bumped on connect and teardown
    generation: AtomicU64,
    /// Bumped by every deliberate disconnect
    session: AtomicU64,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    tasks: Mutex<Tasks>,
    link: Mutex<Link>,
    key: Mutex<Option<Arc<RsaPrivateKey>>>,
    tracker: Mutex<ReconnectTracker>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl Inner {
    fn new(config: SeestarConfig) -> Self {
        let tracker = ReconnectTracker::new(config.reconnect.clone());
        Self {
            observer_location: RwLock::new(config.observer_location.clone()),
            config,
            pending: PendingTable::new(),
            events: EventDispatcher::new(),
            status: StatusModel::new(),
            endpoint: RwLock::new(None),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            session: AtomicU64::new(0),
            writer: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            link: Mutex::new(Link::default()),
            key: Mutex::new(None),
            tracker: Mutex::new(tracker),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Full connect sequence: discovery, TCP, receive loop, auth, heartbeat, seed
    async fn connect(self: &Arc<Self>, host: &str, port: u16) -> SeestarResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            tracing::warn!("Already connected to Seestar");
            return Ok(());
        }
        write(&self.endpoint, Some((host.to_string(), port)));

        if self.config.discovery_enabled {
            let request = protocol::discovery_request(
                &self.config.app_version,
                &self.config.protocol_version,
            );
            transport::send_discovery(
                host,
                self.config.discovery_port,
                &request,
                self.config.discovery_timeout(),
            )
            .await;
        }

        tracing::info!("Connecting to Seestar at {}:{}", host, port);
        let stream = transport::open_stream(host, port, self.config.connection_timeout()).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        self.pending.reset_ids();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.link) = Link {
            generation,
            ..Link::default()
        };
        *lock(&self.writer) = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        {
            let mut tasks = lock(&self.tasks);
            tasks.writer = Some(tokio::spawn(writer_task(write_half, rx)));
            tasks.reader = Some(tokio::spawn(receive_loop(
                Arc::downgrade(self),
                read_half,
                generation,
            )));
        }
        self.status.set_connected(true, OperationStage::Connected);
        tracing::info!("Connected to Seestar at {}:{}", host, port);

        if let Err(e) = self.authenticate().await {
            tracing::error!("Authentication failed: {}", e);
            return Err(self.abandon_connect("Authentication failed", e));
        }
        let lost_during_handshake = {
            let mut link = lock(&self.link);
            let current = self.generation.load(Ordering::SeqCst) == generation;
            if current && link.generation == generation && !link.lost {
                link.established = true;
                false
            } else {
                true
            }
        };
        if lost_during_handshake {
            let e = SeestarError::ConnectionClosed(
                "Connection lost during authentication".to_string(),
            );
            return Err(self.abandon_connect("Connection lost during authentication", e));
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        ));
        lock(&self.tasks).heartbeat = Some(heartbeat);

        let client = SeestarClient {
            inner: Arc::clone(self),
        };
        if let Err(e) = client.get_device_state(None).await {
            tracing::warn!("Failed to get initial device state: {}", e);
        }
        Ok(())
    }

    /// Tear down a half-open connection and leave the client disconnected
    fn abandon_connect(&self, reason: &str, error: SeestarError) -> SeestarError {
        self.teardown(reason);
        let message = error.to_string();
        self.status.update(|s| {
            s.connected = false;
            s.stage = OperationStage::Disconnected;
            s.is_tracking = false;
            s.last_error = Some(message);
        });
        error
    }

    /// Status after a deliberate disconnect
    fn mark_disconnected(&self) {
        self.status
            .set_connected(false, OperationStage::Disconnected);
    }

    async fn authenticate(&self) -> SeestarResult<()> {
        let key = self.private_key()?;
        auth::authenticate(self, &key).await
    }

    /// Load the key once; later connects reuse it
    fn private_key(&self) -> SeestarResult<Arc<RsaPrivateKey>> {
        if let Some(key) = lock(&self.key).clone() {
            return Ok(key);
        }
        let path = auth::resolve_key_path(self.config.private_key_path.as_deref());
        let key = Arc::new(auth::load_private_key(&path)?);
        *lock(&self.key) = Some(Arc::clone(&key));
        Ok(key)
    }

    /// Close the current connection and fail everything still waiting on it
    fn teardown(&self, reason: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.writer).take();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        tasks.abort_all();
        let failed = self.pending.fail_all(reason);
        if failed > 0 {
            tracing::debug!("Failed {} pending commands: {}", failed, reason);
        }
    }

    /// Send one command and wait for the response carrying its id
    pub(crate) async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_override: Option<Duration>,
    ) -> SeestarResult<DeviceMessage> {
        if !self.is_connected() {
            return Err(SeestarError::NotConnected);
        }
        let sender = lock(&self.writer).clone().ok_or(SeestarError::NotConnected)?;

        let (id, rx) = self.pending.register();
        let _entry = self.pending.guard(id);
        let line = CommandRequest::new(method, id, params.as_ref()).encode()?;

        if method == methods::GET_EQU_COORD {
            tracing::trace!("Sending: {}", line.trim_end());
        } else {
            tracing::debug!("Sending: {}", line.trim_end());
        }

        if sender.send(line).await.is_err() {
            return Err(SeestarError::ConnectionClosed(format!(
                "Failed to send command '{}'",
                method
            )));
        }

        let wait = timeout_override.unwrap_or_else(|| self.config.command_timeout());
        match timeout(wait, rx).await {
            Ok(Ok(Ok(message))) => message.check(method),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SeestarError::ConnectionClosed(format!(
                "Response channel for '{}' dropped",
                method
            ))),
            Err(_) => {
                tracing::warn!("Command '{}' (id {}) timed out after {:?}", method, id, wait);
                Err(SeestarError::command_timeout(method, wait))
            }
        }
    }

    fn handle_line(&self, line: &str) {
        match protocol::decode_line(line) {
            Ok(Some(message)) => self.handle_message(message),
            Ok(None) => {}
            Err(e) => tracing::warn!("Invalid JSON received: {} ({})", line.trim(), e),
        }
    }

    fn handle_message(&self, message: DeviceMessage) {
        if message.method() == Some(methods::GET_EQU_COORD) {
            tracing::trace!("Received: {}", message.raw());
        } else {
            tracing::debug!("Received: {}", message.raw());
        }

        let message = match message.id() {
            Some(id) => match self.pending.resolve(id, message) {
                Ok(()) => return,
                Err(unmatched) if self.pending.was_issued(id) => {
                    tracing::debug!(
                        "Dropping late response for id {}: {}",
                        id,
                        unmatched.raw()
                    );
                    return;
                }
                Err(unmatched) => unmatched,
            },
            None => message,
        };

        let event = events::classify(&message);
        self.apply_event(&event);
        self.events.dispatch(&event);
    }

    /// Fold event content into the status snapshot before subscribers see it
    fn apply_event(&self, event: &DeviceEvent) {
        match event.kind {
            EventKind::StateChange => {
                let stage = event
                    .get_str("state")
                    .and_then(OperationStage::parse)
                    .or_else(|| {
                        event
                            .get_str("stage")
                            .and_then(|s| OperationStage::from_device_stage(Some(s)))
                    });
                if let Some(stage) = stage {
                    self.status.set_stage(stage);
                }
            }
            EventKind::Error => {
                let message = event
                    .get_str("error")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Device error: {}", event.data));
                self.status.set_error(message);
            }
            _ => {}
        }
    }

    /// Bounded reconnect after the receive loop lost the stream.
    ///
    /// Boxed because `connect` and `reconnect` reach each other through the
    /// receive loop.
    fn reconnect(self: Arc<Self>, reason: String, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _serial = self.reconnect_lock.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("Ignoring reconnect request for a replaced connection");
                return;
            }

            let session = self.session.load(Ordering::SeqCst);
            let max_retries = self.config.reconnect.max_retries;
            let mut reason = reason;
            loop {
                let decision = lock(&self.tracker).record_miss(Instant::now());
                match decision {
                    ReconnectDecision::GiveUp { misses } => {
                        tracing::error!("Max reconnection attempts ({}) reached", max_retries);
                        self.teardown("Connection lost - max retries exceeded");
                        let error = SeestarError::ReconnectionFailed {
                            attempts: misses.saturating_sub(1),
                            last_error: reason,
                        };
                        let message = error.to_string();
                        self.status.update(|s| {
                            s.connected = false;
                            s.stage = OperationStage::Error;
                            s.is_tracking = false;
                            s.last_error = Some(message);
                        });
                        return;
                    }
                    ReconnectDecision::Retry { attempt } => {
                        tracing::info!(
                            "Attempting auto-reconnect ({}/{}) after: {}",
                            attempt,
                            max_retries,
                            reason
                        );
                        self.teardown(&reason);
                        let message = format!(
                            "Connection lost ({}), reconnecting {}/{}",
                            reason, attempt, max_retries
                        );
                        self.status.update(|s| {
                            s.connected = false;
                            s.stage = OperationStage::Reconnecting;
                            s.is_tracking = false;
                            s.last_error = Some(message);
                        });

                        sleep(self.config.reconnect.retry_delay()).await;
                        if self.session.load(Ordering::SeqCst) != session {
                            tracing::info!("Auto-reconnect cancelled by disconnect");
                            self.mark_disconnected();
                            return;
                        }

                        let Some((host, port)) = read(&self.endpoint) else {
                            return;
                        };
                        match self.connect(&host, port).await {
                            Ok(()) if self.session.load(Ordering::SeqCst) != session => {
                                tracing::info!("Disconnect requested while reconnecting; closing");
                                self.teardown("Client disconnected");
                                self.mark_disconnected();
                                return;
                            }
                            Ok(()) => {
                                lock(&self.tracker).reset();
                                tracing::info!("Auto-reconnect successful");
                                return;
                            }
                            Err(e) => {
                                tracing::warn!("Auto-reconnect attempt {} failed: {}", attempt, e);
                                if self.session.load(Ordering::SeqCst) != session {
                                    self.mark_disconnected();
                                    return;
                                }
                                reason = e.to_string();
                                self.status.set_error(format!("Reconnect failed: {}", reason));
                            }
                        }
                    }
                }
            }
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = std::mem::take(
            self.tasks
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        tasks.abort_all();
    }
}

/// Drains the outgoing queue into the socket
async fn writer_task(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!("Seestar write error: {}", e);
            break;
        }
    }
}

async fn receive_loop(inner: Weak<Inner>, read_half: OwnedReadHalf, generation: u64) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(4096);

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::warn!("Connection closed by telescope");
                break "Connection closed by telescope".to_string();
            }
            Ok(_) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle_line(&String::from_utf8_lossy(&buf));
            }
            Err(e) => {
                tracing::error!("Receive loop error: {}", e);
                let reason = format!("Receive error: {}", e);
                if let Some(inner) = inner.upgrade() {
                    let message = reason.clone();
                    inner.status.update(|s| {
                        s.stage = OperationStage::Error;
                        s.is_tracking = false;
                        s.last_error = Some(message);
                    });
                }
                break reason;
            }
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.pending.fail_all(&reason);
    let established = {
        let mut link = lock(&inner.link);
        if link.generation != generation {
            return;
        }
        link.lost = true;
        link.established
    };
    if !established {
        tracing::debug!("Stream ended before authentication finished; not reconnecting");
        return;
    }
    if inner.is_connected() && inner.generation.load(Ordering::SeqCst) == generation {
        tokio::spawn(Arc::clone(&inner).reconnect(reason, generation));
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, interval: Duration, heartbeat_timeout: Duration) {
    loop {
        sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_connected() {
            break;
        }
        match inner
            .send_command(methods::TEST_CONNECTION, None, Some(heartbeat_timeout))
            .await
        {
            Ok(_) => tracing::debug!("Heartbeat sent successfully"),
            Err(e) => tracing::warn!("Heartbeat failed: {}", e),
        }
    }
    tracing::debug!("Heartbeat loop stopped");
}

/// Seestar smart telescope client
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SeestarClient {
    pub(crate) inner: Arc<Inner>,
}

impl SeestarClient {
    pub fn new(config: SeestarConfig) -> Self {
        Self {
            inner: Arc::new(Inner::new(config)),
        }
    }

    /// Default configuration with an explicit private key location
    pub fn with_private_key(path: impl Into<PathBuf>) -> Self {
        Self::new(SeestarConfig {
            private_key_path: Some(path.into()),
            ..SeestarConfig::default()
        })
    }

    pub fn config(&self) -> &SeestarConfig {
        &self.inner.config
    }

    /// Connect and authenticate. A second call while connected is a no-op.
    pub async fn connect(&self, host: &str, port: u16) -> SeestarResult<()> {
        self.inner.connect(host, port).await
    }

    pub async fn connect_device(&self, device: &DeviceConfig) -> SeestarResult<()> {
        self.connect(&device.host, device.port).await
    }

    /// Close the connection. Pending commands fail with `ConnectionClosed`
    /// and any reconnect in progress stops.
    pub async fn disconnect(&self) -> SeestarResult<()> {
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        if !self.inner.is_connected() {
            return Ok(());
        }
        tracing::info!("Disconnecting from Seestar");
        self.inner.teardown("Client disconnected");
        self.inner.mark_disconnected();
        tracing::info!("Disconnected from Seestar");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Last host passed to `connect`
    pub fn host(&self) -> Option<String> {
        read(&self.inner.endpoint).map(|(host, _)| host)
    }

    pub fn port(&self) -> Option<u16> {
        read(&self.inner.endpoint).map(|(_, port)| port)
    }

    /// Snapshot of the current status
    pub fn status(&self) -> SeestarStatus {
        self.inner.status.snapshot()
    }

    /// Observe every status change. Replaces any previous observer.
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(&SeestarStatus) + Send + Sync + 'static,
    {
        self.inner.status.set_observer(Some(Arc::new(callback)));
    }

    pub fn clear_status_callback(&self) {
        self.inner.status.set_observer(None);
    }

    pub fn observer_location(&self) -> Option<ObserverLocation> {
        read(&self.inner.observer_location)
    }

    pub fn set_observer_location(&self, location: Option<ObserverLocation>) {
        write(&self.inner.observer_location, location);
    }

    /// Unexpected disconnects counted in the current miss window
    pub fn reconnect_misses(&self) -> u32 {
        lock(&self.inner.tracker).miss_count()
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, Arc::new(callback))
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(kind, id)
    }

    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_all(Arc::new(callback))
    }

    pub fn unsubscribe_all(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe_all(id)
    }

    /// Progress shortcut receiving `(percent, details)`
    pub fn subscribe_progress<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(f64, &Value) + Send + Sync + 'static,
    {
        let callback: ProgressCallback = Arc::new(callback);
        self.inner.events.subscribe_progress(callback)
    }

    pub fn unsubscribe_progress(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe_progress(id)
    }

    /// Send a raw command and wait for its response
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> SeestarResult<DeviceMessage> {
        self.inner.send_command(method, params, timeout).await
    }

    pub(crate) async fn command(&self, method: &str, params: Value) -> SeestarResult<DeviceMessage> {
        self.inner.send_command(method, Some(params), None).await
    }

    pub(crate) async fn command_no_params(&self, method: &str) -> SeestarResult<DeviceMessage> {
        self.inner.send_command(method, None, None).await
    }

    /// Send and report whether the device accepted it (`result == 0`)
    pub(crate) async fn command_accepted(&self, method: &str, params: Value) -> SeestarResult<bool> {
        let response = self.command(method, params).await?;
        let accepted = response.is_accepted();
        if !accepted {
            tracing::warn!("{} not accepted: {}", method, response.raw());
        }
        Ok(accepted)
    }

    /// Send and return the `result` object (empty if absent)
    pub(crate) async fn query(&self, method: &str, params: Option<Value>) -> SeestarResult<Value> {
        let response = self.inner.send_command(method, params, None).await?;
        Ok(response.result_or_empty())
    }

    pub(crate) fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub(crate) fn status_model(&self) -> &StatusModel {
        &self.inner.status
    }
}

impl Default for SeestarClient {
    fn default() -> Self {
        Self::new(SeestarConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockTelescope};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn connected_client() -> (SeestarClient, MockTelescope) {
        let mock = MockTelescope::start().await;
        let client = SeestarClient::new(test_config(&mock));
        client.connect("127.0.0.1", mock.port()).await.unwrap();
        (client, mock)
    }

    async fn wait_for_stage(client: &SeestarClient, stage: OperationStage) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.status().stage != stage {
            assert!(
                Instant::now() < deadline,
                "stage stuck at {:?}, wanted {:?}",
                client.status().stage,
                stage
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_command_rejected_when_disconnected() {
        let client = SeestarClient::default();
        let err = client
            .send_command(methods::TEST_CONNECTION, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SeestarError::NotConnected));
        assert_eq!(client.status().stage, OperationStage::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_authenticates_then_seeds_status() {
        let (client, mock) = connected_client().await;
        assert!(client.is_connected());
        assert_eq!(client.host().as_deref(), Some("127.0.0.1"));
        assert_eq!(client.port(), Some(mock.port()));

        let methods_seen = mock.methods();
        assert_eq!(methods_seen[0], methods::GET_VERIFY_STR);
        assert_eq!(methods_seen[1], methods::VERIFY_CLIENT);
        assert_eq!(methods_seen[2], methods::GET_DEVICE_STATE);

        let status = client.status();
        assert!(status.connected);
        assert_eq!(status.stage, OperationStage::Connected);
        assert_eq!(status.firmware_version.as_deref(), Some("6.45"));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_connect_is_noop() {
        let (client, mock) = connected_client().await;
        client.connect("127.0.0.1", mock.port()).await.unwrap();
        assert_eq!(mock.connection_count(), 1);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_unique_and_increasing() {
        let (client, mock) = connected_client().await;
        for _ in 0..5 {
            client
                .send_command(methods::PI_GET_TIME, None, None)
                .await
                .unwrap();
        }
        let ids: Vec<u64> = mock
            .requests()
            .iter()
            .filter_map(|r| r["id"].as_u64())
            .collect();
        assert!(ids[0] >= protocol::FIRST_COMMAND_ID);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_responses_matched_out_of_order() {
        let (client, mock) = connected_client().await;
        mock.withhold(methods::PI_GET_INFO);

        let mut calls = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                client
                    .send_command(methods::PI_GET_INFO, None, None)
                    .await
                    .unwrap()
            }));
        }

        let ids = mock.wait_for_ids(methods::PI_GET_INFO, 3).await;
        for id in ids.iter().rev() {
            mock.push(json!({
                "jsonrpc": "2.0",
                "method": methods::PI_GET_INFO,
                "id": id,
                "code": 0,
                "result": {"echo": id}
            }));
        }

        let mut expected = ids.clone();
        let mut seen = Vec::new();
        for call in calls {
            let response = call.await.unwrap();
            assert_eq!(response.result()["echo"].as_u64(), response.id());
            seen.push(response.id().unwrap());
        }
        seen.sort_unstable();
        expected.sort_unstable();
        assert_eq!(seen, expected);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_leaves_connection_usable() {
        let (client, mock) = connected_client().await;
        mock.withhold(methods::PI_GET_TIME);

        let err = client
            .send_command(methods::PI_GET_TIME, None, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, SeestarError::CommandTimeout { ref method, .. } if method == "pi_get_time"));
        assert!(client.is_connected());

        let ok = client
            .send_command(methods::PI_GET_INFO, None, None)
            .await
            .unwrap();
        assert!(ok.is_accepted());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_late_response_is_not_an_event() {
        let (client, mock) = connected_client().await;
        mock.withhold(methods::PI_GET_TIME);
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        client.subscribe_all(move |_: &DeviceEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = client
            .send_command(methods::PI_GET_TIME, None, Some(Duration::from_millis(100)))
            .await;
        let id = mock.wait_for_ids(methods::PI_GET_TIME, 1).await[0];
        mock.push(json!({"id": id, "method": "pi_get_time", "result": {"state": "late"}}));

        // Round trip on the same stream guarantees the late line was read
        client
            .send_command(methods::PI_GET_INFO, None, None)
            .await
            .unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 0);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_error_becomes_command_error() {
        let (client, mock) = connected_client().await;
        mock.respond_with(
            methods::SCOPE_PARK,
            json!({"code": 207, "error": "mount not ready"}),
        );
        let err = client
            .send_command(methods::SCOPE_PARK, Some(json!({"equ_mode": false})), None)
            .await
            .unwrap_err();
        match err {
            SeestarError::Command { method, code, message } => {
                assert_eq!(method, "scope_park");
                assert_eq!(code, 207);
                assert_eq!(message, "mount not ready");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_commands() {
        let (client, mock) = connected_client().await;
        mock.withhold(methods::GET_VIEW_STATE);

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_command(methods::GET_VIEW_STATE, None, None)
                    .await
            })
        };
        mock.wait_for_ids(methods::GET_VIEW_STATE, 1).await;
        client.disconnect().await.unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SeestarError::ConnectionClosed(_)));
        assert!(!client.is_connected());
        assert_eq!(client.status().stage, OperationStage::Disconnected);
    }

    #[tokio::test]
    async fn test_unsolicited_events_update_status_and_dispatch() {
        let (client, mock) = connected_client().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(EventKind::StateChange, move |event: &DeviceEvent| {
            let _ = tx.send(event.get_str("state").map(str::to_string));
        });

        mock.push(json!({"Event": "View", "result": {"state": "tracking"}}));
        let state = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(state.as_deref(), Some("tracking"));
        assert_eq!(client.status().stage, OperationStage::Tracking);
        assert!(client.status().is_tracking);

        mock.push(json!({"Event": "Alert", "error": "fan stalled", "code": 301}));
        client
            .send_command(methods::PI_GET_INFO, None, None)
            .await
            .unwrap();
        assert_eq!(client.status().last_error.as_deref(), Some("fan stalled"));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_is_dropped() {
        let (client, mock) = connected_client().await;
        mock.push_raw("{not json");
        let ok = client
            .send_command(methods::PI_GET_INFO, None, None)
            .await
            .unwrap();
        assert!(ok.is_accepted());
        assert!(client.is_connected());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_client_disconnected() {
        let mock = MockTelescope::start().await;
        mock.respond_with(
            methods::VERIFY_CLIENT,
            json!({"result": 1, "code": 1, "error": "verify failed"}),
        );
        let client = SeestarClient::new(test_config(&mock));
        let err = client.connect("127.0.0.1", mock.port()).await.unwrap_err();
        assert!(matches!(err, SeestarError::AuthenticationFailed(_)));
        assert!(!client.is_connected());

        let status = client.status();
        assert!(!status.connected);
        assert_eq!(status.stage, OperationStage::Disconnected);
        assert!(status.last_error.is_some());
        assert!(matches!(
            client.send_command(methods::PI_GET_INFO, None, None).await,
            Err(SeestarError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_connect() {
        let mock = MockTelescope::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&mock);
        config.private_key_path = Some(dir.path().join("nope.pem"));
        let client = SeestarClient::new(config);
        let err = client.connect("127.0.0.1", mock.port()).await.unwrap_err();
        assert!(matches!(err, SeestarError::KeyNotFound { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_drop() {
        let (client, mock) = connected_client().await;
        mock.drop_connection();

        let deadline = Instant::now() + Duration::from_secs(5);
        while mock.connection_count() < 2 || !client.is_connected() {
            assert!(Instant::now() < deadline, "client did not reconnect");
            sleep(Duration::from_millis(20)).await;
        }
        // Wait out the seeding query so the counter has been reset
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.reconnect_misses() != 0 {
            assert!(Instant::now() < deadline, "miss counter not reset");
            sleep(Duration::from_millis(20)).await;
        }

        let ok = client
            .send_command(methods::PI_GET_INFO, None, None)
            .await
            .unwrap();
        assert!(ok.is_accepted());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_retries() {
        let (client, mock) = connected_client().await;
        mock.close_on(methods::GET_VERIFY_STR);
        mock.drop_connection();

        wait_for_stage(&client, OperationStage::Error).await;
        assert!(!client.is_connected());
        // One original connection plus three refused attempts
        assert_eq!(mock.connection_count(), 4);
        let last_error = client.status().last_error.unwrap_or_default();
        assert!(
            last_error.starts_with("Reconnection failed after 3 attempts"),
            "{}",
            last_error
        );

        // The loop is finished: nothing dials again
        sleep(Duration::from_millis(300)).await;
        assert_eq!(mock.connection_count(), 4);
        assert_eq!(client.status().stage, OperationStage::Error);
    }

    #[tokio::test]
    async fn test_stream_lost_during_handshake_does_not_reconnect() {
        let mock = MockTelescope::start().await;
        mock.close_on(methods::VERIFY_CLIENT);
        let client = SeestarClient::new(test_config(&mock));

        let err = client.connect("127.0.0.1", mock.port()).await.unwrap_err();
        assert!(matches!(err, SeestarError::AuthenticationFailed(_)), "{}", err);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(mock.connection_count(), 1);
        assert!(!client.is_connected());
        let status = client.status();
        assert_eq!(status.stage, OperationStage::Disconnected);
        assert!(status
            .last_error
            .unwrap_or_default()
            .starts_with("Authentication failed"));
        assert_eq!(client.reconnect_misses(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_reconnect_stays_disconnected() {
        // Discovery target that never answers keeps each connect busy for a while
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mock = MockTelescope::start().await;
        let mut config = test_config(&mock);
        config.discovery_enabled = true;
        config.discovery_port = silent.local_addr().unwrap().port();
        config.discovery_timeout_ms = 400;
        let client = SeestarClient::new(config);
        client.connect("127.0.0.1", mock.port()).await.unwrap();

        mock.drop_connection();
        wait_for_stage(&client, OperationStage::Reconnecting).await;
        // Past the retry delay, inside the next connect's discovery wait
        sleep(Duration::from_millis(150)).await;
        client.disconnect().await.unwrap();

        sleep(Duration::from_millis(1200)).await;
        assert!(!client.is_connected());
        assert_eq!(client.status().stage, OperationStage::Disconnected);
        assert!(matches!(
            client.send_command(methods::PI_GET_INFO, None, None).await,
            Err(SeestarError::NotConnected)
        ));
        drop(silent);
    }

    #[tokio::test]
    async fn test_status_callback_sees_connect() {
        let mock = MockTelescope::start().await;
        let client = SeestarClient::new(test_config(&mock));
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stages);
        client.set_status_callback(move |status: &SeestarStatus| {
            lock(&sink).push(status.stage);
        });
        client.connect("127.0.0.1", mock.port()).await.unwrap();
        client.disconnect().await.unwrap();

        let stages = lock(&stages).clone();
        assert_eq!(stages.first(), Some(&OperationStage::Connected));
        assert_eq!(stages.last(), Some(&OperationStage::Disconnected));
    }
}
