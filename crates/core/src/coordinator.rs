//! Command/response coordinator.
//!
//! One worker thread per device owns the transport and drains a FIFO request
//! queue, so exactly one command is in flight per device. Each request carries
//! a oneshot reply; callers hold a [`CommandFuture`].
//!
//! The worker also drives the failure half of the connection state machine:
//! failed commands degrade the connection, an exhausted retry budget closes the
//! transport and re-probes it while queued commands wait in a backlog.

use crate::comm::ErrorClass;
use crate::config::CoreContext;
use crate::connection::{ConnectionConfig, ConnectionState, DeviceReport, DeviceShared};
use crate::error::{Error, ErrorContext, Result};
use crate::protocol::{Adapter, CommandResult, Decoded, DeviceEvent, ProtocolCommand};
use crate::registry::EnumeratedDevice;
use crate::transport::{Transport, TransportOpener};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, trace, warn};

/// Sleeps are sliced so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

pub(crate) enum Request {
    Command {
        command: ProtocolCommand,
        reply: oneshot::Sender<Result<CommandResult>>,
    },
    Reconnect,
}

/// Resolves with the result of one submitted command.
pub struct CommandFuture {
    rx: oneshot::Receiver<Result<CommandResult>>,
    context: ErrorContext,
}

impl CommandFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<CommandResult>>, context: ErrorContext) -> Self {
        Self { rx, context }
    }
}

impl Future for CommandFuture {
    type Output = Result<CommandResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::dropped(
                "device worker went away",
                self.context.clone(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn spawn_worker(
    shared: Arc<DeviceShared>,
    device: EnumeratedDevice,
    opener: Arc<dyn TransportOpener>,
    context: CoreContext,
    rx: mpsc::Receiver<Request>,
    probe_reply: oneshot::Sender<Result<()>>,
    done: oneshot::Sender<()>,
) -> Result<()> {
    let name = format!("device-{}", shared.id);
    let worker = Worker {
        config: context.config.connection.clone(),
        shared,
        device,
        opener,
        rx,
        transport: None,
        adapter: None,
        failures: 0,
        needs_reconnect: false,
        backlog: VecDeque::new(),
    };
    let dispatch = context.dispatch.clone();
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let span = info_span!("device", id = %worker.shared.id);
                let _enter = span.enter();
                worker.run(probe_reply, done);
            })
        })
        .map_err(|e| Error::Hid(format!("failed to spawn device worker: {e}")))?;
    Ok(())
}

struct Worker {
    shared: Arc<DeviceShared>,
    device: EnumeratedDevice,
    opener: Arc<dyn TransportOpener>,
    config: ConnectionConfig,
    rx: mpsc::Receiver<Request>,
    transport: Option<Box<dyn Transport>>,
    adapter: Option<Adapter>,
    /// Consecutive failed attempts since the last success.
    failures: u32,
    needs_reconnect: bool,
    /// Requests carried across a reconnect, served before the queue.
    backlog: VecDeque<Request>,
}

impl Worker {
    fn run(mut self, probe_reply: oneshot::Sender<Result<()>>, done: oneshot::Sender<()>) {
        self.shared.transition(ConnectionState::Probing, 0);
        match self.probe(0) {
            Ok(()) => {
                self.shared.transition(ConnectionState::Connected, 0);
                self.shared.metrics.lock().mark_connected();
                let _ = probe_reply.send(Ok(()));
            }
            Err(err) => {
                warn!(error = %err, "Initial probe failed");
                // The handle is released before the caller hears back.
                self.finish(done);
                let _ = probe_reply.send(Err(err));
                return;
            }
        }

        while let Some(request) = self.next_request() {
            match request {
                Request::Command { command, reply } => {
                    let result = self.execute(&command);
                    let _ = reply.send(result);
                }
                Request::Reconnect => {
                    debug!("Reconnect requested");
                    self.needs_reconnect = true;
                }
            }
            if self.shared.is_shutting_down() {
                break;
            }
            if self.needs_reconnect && !self.reconnect() {
                break;
            }
        }
        self.finish(done);
    }

    fn next_request(&mut self) -> Option<Request> {
        if let Some(request) = self.backlog.pop_front() {
            return Some(request);
        }
        self.rx.blocking_recv()
    }

    fn context(&self, attempt: u32) -> ErrorContext {
        self.shared.context(attempt)
    }

    /// Run one command through the retry budget.
    fn execute(&mut self, command: &ProtocolCommand) -> Result<CommandResult> {
        let Some(adapter) = self.adapter.as_ref() else {
            return Err(Error::connection_failed("no adapter", self.context(0)));
        };
        // Encode errors are the caller's fault, not the device's.
        let frame = adapter.encode_command(command)?;
        let timeout = command.timeout().unwrap_or(self.config.command_timeout());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            self.shared.metrics.lock().commands_sent += 1;
            match self.exchange_current(&frame, command, timeout) {
                Ok(result) => {
                    self.on_success(started.elapsed());
                    return Ok(result);
                }
                Err(err) => {
                    let err = err.with_context(self.context(attempt));
                    self.on_failure(&err);
                    if self.failures >= self.config.retry_budget {
                        warn!(error = %err, failures = self.failures, "Retry budget exhausted");
                        self.needs_reconnect = true;
                        return Err(err);
                    }
                    if !ErrorClass::classify(&err).is_retryable() {
                        return Err(err);
                    }
                    let delay = self.config.retry_backoff(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying command"
                    );
                    if !self.sleep(delay) {
                        return Err(Error::dropped("device disconnected", self.context(attempt)));
                    }
                }
            }
        }
    }

    fn exchange_current(
        &mut self,
        frame: &[u8],
        command: &ProtocolCommand,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let (Some(adapter), Some(transport)) = (self.adapter.as_ref(), self.transport.as_mut())
        else {
            return Err(Error::Hid("transport closed".into()));
        };
        exchange(&self.shared, adapter, transport.as_mut(), frame, command, timeout)
    }

    fn on_success(&mut self, elapsed: Duration) {
        self.failures = 0;
        self.shared.metrics.lock().record_response(elapsed);
        if self.shared.state() == ConnectionState::Degraded {
            self.shared.transition(ConnectionState::Connected, 0);
        }
    }

    fn on_failure(&mut self, err: &Error) {
        self.failures += 1;
        warn!(error = %err, failures = self.failures, "Command failed");
        self.shared.metrics.lock().record_error(err);
        if self.shared.state() == ConnectionState::Connected {
            self.shared
                .transition(ConnectionState::Degraded, self.failures);
        }
    }

    /// Try every transport of the descriptor in priority order.
    fn probe(&mut self, attempt: u32) -> Result<()> {
        let mut kinds = self.shared.descriptor.transports.clone();
        kinds.sort();
        kinds.dedup();

        let mut last_error = None;
        for kind in kinds {
            if self.shared.is_shutting_down() {
                break;
            }
            match self.probe_transport(kind) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(%kind, error = %err, "Transport probe failed");
                    self.transport = None;
                    last_error = Some(err);
                }
            }
        }
        let reason = match last_error {
            Some(err) => format!("all transports failed, last error: {err}"),
            None => "no transport to try".to_string(),
        };
        Err(Error::connection_failed(reason, self.context(attempt)))
    }

    fn probe_transport(&mut self, kind: crate::transport::TransportKind) -> Result<()> {
        let descriptor = self.shared.descriptor.clone();
        let mut transport = self.opener.open(&self.device, &descriptor, kind)?;
        let mut adapter = Adapter::for_descriptor(&descriptor);
        let probe_timeout = self.config.probe_timeout();

        let identify = adapter.identify_command();
        let frame = adapter.encode_command(&identify)?;
        let result = exchange(
            &self.shared,
            &adapter,
            transport.as_mut(),
            &frame,
            &identify,
            probe_timeout,
        )?;
        if !result.is_ok() {
            return Err(Error::protocol(format!(
                "identify answered with {:?}",
                result.status()
            )));
        }

        for lookup in adapter.discovery_commands() {
            let frame = adapter.encode_command(&lookup)?;
            match exchange(
                &self.shared,
                &adapter,
                transport.as_mut(),
                &frame,
                &lookup,
                probe_timeout,
            ) {
                Ok(result) => adapter.absorb_discovery(&lookup, &result),
                Err(err) => warn!(error = %err, "Feature discovery failed"),
            }
        }

        debug!(%kind, "Probe succeeded");
        *self.shared.adapter.lock() = Some(adapter.clone());
        self.adapter = Some(adapter);
        self.transport = Some(transport);
        Ok(())
    }

    /// Close and re-probe. Returns false if the device is gone for good.
    fn reconnect(&mut self) -> bool {
        self.needs_reconnect = false;
        self.shared.transition(ConnectionState::Reconnecting, self.failures);
        self.transport = None;
        self.collect_backlog();
        self.shared.metrics.lock().reconnect_count += 1;

        let max = self.config.max_reconnect_attempts;
        for attempt in 1..=max {
            if self.shared.is_shutting_down() {
                return false;
            }
            match self.probe(attempt) {
                Ok(()) => {
                    self.failures = 0;
                    self.shared.transition(ConnectionState::Connected, attempt);
                    self.shared.metrics.lock().mark_connected();
                    self.collect_backlog();
                    return true;
                }
                Err(err) => {
                    warn!(attempt, max, error = %err, "Reconnection attempt failed");
                    if attempt < max && !self.sleep(self.config.reconnect_backoff(attempt)) {
                        return false;
                    }
                }
            }
        }
        self.shared.transition(ConnectionState::Disconnected, max);
        false
    }

    /// Move queued requests into the backlog, bounded by `requeue_depth`.
    fn collect_backlog(&mut self) {
        while let Ok(request) = self.rx.try_recv() {
            if self.backlog.len() < self.config.requeue_depth {
                self.backlog.push_back(request);
            } else {
                let err = Error::dropped("requeue depth exceeded", self.context(0));
                reject(request, err);
            }
        }
    }

    /// Sleep in slices; false if shutdown was requested meanwhile.
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.shared.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    fn finish(mut self, done: oneshot::Sender<()>) {
        self.transport = None;
        self.shared.transition(ConnectionState::Disconnected, 0);
        // No handle is held from here on; a new connect may take over.
        self.shared.live.store(false, Ordering::Release);
        self.rx.close();
        let leftovers: Vec<Request> = self.backlog.drain(..).collect();
        for request in leftovers {
            reject(
                request,
                Error::connection_failed("device disconnected", self.context(0)),
            );
        }
        while let Ok(request) = self.rx.try_recv() {
            reject(
                request,
                Error::connection_failed("device disconnected", self.context(0)),
            );
        }
        debug!("Device worker stopped");
        let _ = done.send(());
    }
}

fn reject(request: Request, err: Error) {
    if let Request::Command { reply, .. } = request {
        let _ = reply.send(Err(err));
    }
}

/// Write one frame and read until the matching response arrives.
///
/// Unsolicited reports and responses to other opcodes are published to
/// subscribers and do not resolve the command.
fn exchange(
    shared: &DeviceShared,
    adapter: &Adapter,
    transport: &mut dyn Transport,
    frame: &[u8],
    command: &ProtocolCommand,
    timeout: Duration,
) -> Result<CommandResult> {
    trace!(
        opcode = format_args!("0x{:04X}", command.opcode()),
        report_hex = format_args!("{:02X?}", frame),
        "TX"
    );
    transport.write_report(frame)?;
    if !command.expects_response() {
        return Ok(CommandResult::sent());
    }

    let deadline = Instant::now() + timeout;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if shared.is_shutting_down() {
            return Err(Error::dropped("device disconnected", ErrorContext::default()));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(timeout.as_millis() as u64));
        }
        let Some(chunk) = transport.read_report(deadline - now)? else {
            continue;
        };
        buf.extend_from_slice(&chunk);

        match adapter.decode_report(&buf)? {
            Decoded::Incomplete { needed } => {
                trace!(buffered = buf.len(), needed, "Partial frame");
            }
            Decoded::Response { opcode, result } if adapter.response_matches(command, opcode) => {
                trace!(
                    opcode = format_args!("0x{:04X}", opcode),
                    report_hex = format_args!("{:02X?}", buf),
                    "RX"
                );
                return Ok(result);
            }
            Decoded::Response { opcode, result } => {
                debug!(
                    opcode = format_args!("0x{:04X}", opcode),
                    "Unmatched response"
                );
                publish(
                    shared,
                    DeviceEvent {
                        opcode,
                        payload: result.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    },
                );
                buf.clear();
            }
            Decoded::Event(event) => {
                publish(shared, event);
                buf.clear();
            }
        }
    }
}

fn publish(shared: &DeviceShared, event: DeviceEvent) {
    trace!(
        opcode = format_args!("0x{:04X}", event.opcode),
        payload_hex = format_args!("{:02X?}", event.payload),
        "Device event"
    );
    let _ = shared.reports.send(DeviceReport {
        device_id: shared.id.clone(),
        event,
    });
}
