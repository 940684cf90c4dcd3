//! Connection manager: device lifecycle and the connection state machine.
//!
//! ```text
//! Disconnected → Probing → Connected ⇄ Degraded
//!                   │          │           │
//!                   │          └────► Reconnecting ◄┘
//!                   ▼                   │      │
//!              Disconnected ◄───────────┘      └──► Connected
//! ```
//!
//! Each connected device gets one worker thread (see [`crate::coordinator`])
//! that owns its transport. The manager only holds the request queue and the
//! state shared with that worker.

use crate::config::CoreContext;
use crate::coordinator::{self, CommandFuture, Request};
use crate::error::{Error, ErrorContext, Result};
use crate::protocol::{Adapter, CommandResult, DeviceEvent, ProtocolCommand};
use crate::registry::{DeviceDescriptor, DeviceId, EnumeratedDevice, Registry};
use crate::transport::TransportOpener;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

/// Lifecycle state of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Connected,
    Degraded,
    Reconnecting,
}

impl ConnectionState {
    /// The complete transition table.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Probing)
                | (Probing, Connected)
                | (Probing, Disconnected)
                | (Connected, Degraded)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Degraded, Connected)
                | (Degraded, Reconnecting)
                | (Degraded, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    /// Whether commands are accepted in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Probing => "probing",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Timing and budget knobs of the connection layer. Durations are in ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub probe_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Consecutive failures tolerated before the handle is re-probed.
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Capacity of each device's request queue.
    pub queue_depth: usize,
    /// Commands carried across a reconnect; the rest are dropped.
    pub requeue_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1000,
            command_timeout_ms: 1000,
            retry_budget: 3,
            backoff_base_ms: 100,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 200,
            queue_depth: 64,
            requeue_depth: 32,
        }
    }
}

impl ConnectionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    /// Delay after failed reconnection attempt `attempt` (1-based), capped at
    /// eight times the base delay.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(3);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(factor))
    }
}

/// Published on every state transition.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub device_id: DeviceId,
    pub descriptor: Arc<DeviceDescriptor>,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub attempt: u32,
}

/// Unsolicited report from a device.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub device_id: DeviceId,
    pub event: DeviceEvent,
}

/// Health counters of one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub error_count: u64,
    pub reconnect_count: u32,
    /// Exponential moving average of round-trip time.
    pub avg_response_ms: f64,
    pub last_error: Option<String>,
    pub connected_since_unix_ms: Option<u64>,
}

impl ConnectionMetrics {
    const EMA_ALPHA: f64 = 0.1;

    pub fn success_rate(&self) -> f64 {
        if self.commands_sent == 0 {
            return 1.0;
        }
        self.commands_succeeded as f64 / self.commands_sent as f64
    }

    pub(crate) fn record_response(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.commands_succeeded += 1;
        self.avg_response_ms = if self.avg_response_ms == 0.0 {
            ms
        } else {
            Self::EMA_ALPHA * ms + (1.0 - Self::EMA_ALPHA) * self.avg_response_ms
        };
    }

    pub(crate) fn record_error(&mut self, err: &Error) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
    }

    pub(crate) fn mark_connected(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.connected_since_unix_ms = Some(now);
    }
}

/// State shared between the manager and a device worker.
pub(crate) struct DeviceShared {
    pub id: DeviceId,
    pub descriptor: Arc<DeviceDescriptor>,
    pub state: Mutex<ConnectionState>,
    pub adapter: Mutex<Option<Adapter>>,
    pub metrics: Mutex<ConnectionMetrics>,
    /// Set while a worker owns (or is opening) a transport for this device.
    pub live: AtomicBool,
    pub shutdown: AtomicBool,
    pub events: broadcast::Sender<StateEvent>,
    pub reports: broadcast::Sender<DeviceReport>,
}

impl DeviceShared {
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn context(&self, attempt: u32) -> ErrorContext {
        ErrorContext::new(self.id.as_str(), self.state(), attempt)
    }

    /// Move to `to` through the transition table. Illegal moves are refused.
    pub fn transition(&self, to: ConnectionState, attempt: u32) -> bool {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if from == to {
                return true;
            }
            if !from.can_transition_to(to) {
                error!(device = %self.id, %from, %to, "Illegal connection state transition");
                return false;
            }
            *state = to;
            from
        };
        info!(device = %self.id, %from, %to, attempt, "Connection state changed");
        let _ = self.events.send(StateEvent {
            device_id: self.id.clone(),
            descriptor: self.descriptor.clone(),
            from,
            to,
            attempt,
        });
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Stays in the map until its worker has exited, so a second transport for
/// the same path cannot be opened while the first is still held.
struct DeviceEntry {
    shared: Arc<DeviceShared>,
    /// Taken by `disconnect`.
    requests: Option<mpsc::Sender<Request>>,
    done: Option<oneshot::Receiver<()>>,
}

impl DeviceEntry {
    fn requests(&self) -> Result<&mpsc::Sender<Request>> {
        self.requests.as_ref().ok_or_else(|| {
            Error::connection_failed("device is disconnecting", self.shared.context(0))
        })
    }
}

/// Owns every device connection of a session.
pub struct ConnectionManager {
    registry: Arc<Registry>,
    opener: Arc<dyn TransportOpener>,
    context: CoreContext,
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
    events: broadcast::Sender<StateEvent>,
    reports: broadcast::Sender<DeviceReport>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<Registry>,
        opener: Arc<dyn TransportOpener>,
        context: CoreContext,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (reports, _) = broadcast::channel(256);
        Self {
            registry,
            opener,
            context,
            devices: Mutex::new(HashMap::new()),
            events,
            reports,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.context.config.connection
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// State transitions of every device.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Unsolicited reports of every device.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DeviceReport> {
        self.reports.subscribe()
    }

    /// Open and probe a device. Resolves once it is `Connected`, or with
    /// `ConnectionFailed` after every transport was tried.
    pub async fn connect(&self, device: &EnumeratedDevice) -> Result<DeviceId> {
        let id = device.id();
        let descriptor = self.registry.match_enumerated(device).ok_or_else(|| {
            Error::DeviceNotFound(format!(
                "{:04X}:{:04X} at {} is not a known device",
                device.vendor_id, device.product_id, device.path
            ))
        })?;

        let (probe_tx, probe_rx) = oneshot::channel();
        {
            let mut devices = self.devices.lock();
            if let Some(entry) = devices.get(&id) {
                if entry.shared.live.load(Ordering::Acquire) {
                    return Err(Error::AlreadyConnected(id.to_string()));
                }
            }

            let shared = Arc::new(DeviceShared {
                id: id.clone(),
                descriptor: descriptor.clone(),
                state: Mutex::new(ConnectionState::Disconnected),
                adapter: Mutex::new(None),
                metrics: Mutex::new(ConnectionMetrics::default()),
                live: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                events: self.events.clone(),
                reports: self.reports.clone(),
            });
            let (tx, rx) = mpsc::channel(self.config().queue_depth.max(1));
            let (done_tx, done_rx) = oneshot::channel();

            coordinator::spawn_worker(
                shared.clone(),
                device.clone(),
                self.opener.clone(),
                self.context.clone(),
                rx,
                probe_tx,
                done_tx,
            )
            .inspect_err(|_| shared.live.store(false, Ordering::Release))?;

            devices.insert(
                id.clone(),
                DeviceEntry {
                    shared,
                    requests: Some(tx),
                    done: Some(done_rx),
                },
            );
        }

        match probe_rx.await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::connection_failed(
                "device worker exited during probe",
                ErrorContext::new(id.as_str(), ConnectionState::Disconnected, 0),
            )),
        }
    }

    fn shared(&self, id: &DeviceId) -> Result<Arc<DeviceShared>> {
        self.devices
            .lock()
            .get(id)
            .map(|e| e.shared.clone())
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    /// Queue a command without blocking. The future resolves in submission order.
    pub fn submit(&self, id: &DeviceId, command: ProtocolCommand) -> Result<CommandFuture> {
        let (tx, shared) = {
            let devices = self.devices.lock();
            let entry = devices
                .get(id)
                .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
            (entry.requests()?.clone(), entry.shared.clone())
        };
        let (reply, rx) = oneshot::channel();
        match tx.try_send(Request::Command { command, reply }) {
            Ok(()) => Ok(CommandFuture::new(rx, shared.context(0))),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(device = %id, "Request queue full");
                Err(Error::dropped("request queue full", shared.context(0)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::connection_failed(
                "device is no longer connected",
                shared.context(0),
            )),
        }
    }

    /// Submit and wait for the result.
    pub async fn execute(&self, id: &DeviceId, command: ProtocolCommand) -> Result<CommandResult> {
        self.submit(id, command)?.await
    }

    /// Close the handle and re-probe from scratch. Queued commands survive.
    pub fn force_reconnect(&self, id: &DeviceId) -> Result<()> {
        let devices = self.devices.lock();
        let entry = devices
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        entry
            .requests()?
            .try_send(Request::Reconnect)
            .map_err(|_| Error::dropped("reconnect request not queued", entry.shared.context(0)))
    }

    /// Stop the worker and release the transport. Idempotent; returns once the
    /// transport has been dropped.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let (shared, done) = {
            let mut devices = self.devices.lock();
            let Some(entry) = devices.get_mut(id) else {
                return Ok(());
            };
            entry.shared.shutdown.store(true, Ordering::Release);
            // Closing the channel wakes a worker blocked on its queue.
            entry.requests = None;
            (entry.shared.clone(), entry.done.take())
        };
        match done {
            Some(done) => {
                let _ = done.await;
            }
            // Another disconnect holds the receiver.
            None => {
                while shared.live.load(Ordering::Acquire) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }

        let mut devices = self.devices.lock();
        if devices
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.shared, &shared))
        {
            devices.remove(id);
        }
        info!(device = %id, "Disconnected");
        Ok(())
    }

    /// Current state. Unknown devices are `Disconnected`.
    pub fn state(&self, id: &DeviceId) -> ConnectionState {
        self.shared(id)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn metrics(&self, id: &DeviceId) -> Result<ConnectionMetrics> {
        Ok(self.shared(id)?.metrics.lock().clone())
    }

    pub fn descriptor(&self, id: &DeviceId) -> Result<Arc<DeviceDescriptor>> {
        Ok(self.shared(id)?.descriptor.clone())
    }

    /// The adapter negotiated by the last successful probe.
    pub fn adapter(&self, id: &DeviceId) -> Result<Adapter> {
        let shared = self.shared(id)?;
        let adapter = shared.adapter.lock().clone();
        adapter.ok_or_else(|| {
            Error::connection_failed("device has not completed a probe", shared.context(0))
        })
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
