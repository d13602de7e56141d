//! Device controller: the single owner of the serial [`Transport`] from
//! the application's point of view. Allocates host sequence numbers,
//! waits for device echo acknowledgement, enforces per-resource mutual
//! exclusion, routes inbound events to callbacks, runs sensor policy,
//! and keeps durable statistics current (spec §4.3).
//!
//! The event-routing/echo-matching split is grounded on
//! `edge/receiver.rs`'s single-task ownership of its `Arc<AtomicU64>`
//! counters plus a dispatch table keyed by message kind; the
//! echo-as-acknowledgement idea and the forced-odd host sequence come
//! straight from spec.md's own wire description.

use crate::clock::SharedClock;
use crate::config::ControllerConfig;
use crate::protocol::commands::CommandValidationError;
use crate::protocol::events::{self, DeviceEvent, FaultCode, FaultLevel, ReturnDirection, SensorKind};
use crate::protocol::frame::Frame;
use crate::protocol::{HostCommand, PushAction, ResourceId};
use crate::transport::{Transport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::sensors::{self, SensorSideEffect};
use super::stats::{DeviceStatistics, StatsStore};

#[derive(Debug)]
pub enum ControllerError {
    ResourceBusy(ResourceId),
    EchoTimeout,
    /// The device echoed back a sequence this controller is waiting on,
    /// but with a different command code than the one it sent.
    EchoMismatch,
    /// The controller shut down while a command's echo was outstanding.
    Cancelled,
    Transport(TransportError),
    Validation(CommandValidationError),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceBusy(r) => write!(f, "resource {r:?} is already busy"),
            Self::EchoTimeout => write!(f, "device did not echo the command in time"),
            Self::EchoMismatch => write!(f, "device echoed a different command than the one sent"),
            Self::Cancelled => write!(f, "command cancelled by controller shutdown"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Validation(e) => write!(f, "invalid command argument: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<TransportError> for ControllerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CommandValidationError> for ControllerError {
    fn from(e: CommandValidationError) -> Self {
        Self::Validation(e)
    }
}

/// One callback slot per inbound event kind, each independently
/// optional. Delivery is fire-and-forget: a slow callback never blocks
/// the event loop because handlers are spawned on their own task.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_coin_inserted: Option<Arc<dyn Fn(u16) + Send + Sync>>,
    pub on_coin_returned: Option<Arc<dyn Fn(ReturnDirection, u16) + Send + Sync>>,
    pub on_button_pressed: Option<Arc<dyn Fn(u8) + Send + Sync>>,
    pub on_status_report: Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>,
    pub on_fault: Option<Arc<dyn Fn(FaultCode, FaultLevel) + Send + Sync>>,
    pub on_progress: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

/// Owns the transport, the pending-echo table, the per-resource busy
/// set, running statistics, and the sensor policy. Shared behind an
/// `Arc` so the heartbeat task, the event-routing task, and callers
/// issuing commands all see the same state.
pub struct DeviceController {
    transport: Transport,
    sequence: AtomicU16,
    busy: parking_lot::Mutex<HashSet<ResourceId>>,
    pending: parking_lot::Mutex<HashMap<u16, (u8, oneshot::Sender<EchoOutcome>)>>,
    stats: parking_lot::Mutex<DeviceStatistics>,
    stats_store: StatsStore,
    callbacks: Callbacks,
    config: ControllerConfig,
    clock: SharedClock,
    shutdown: watch::Sender<bool>,
}

/// Resolution of an outstanding echo wait, reported back through the
/// `pending` map's oneshot by whichever path observes it first: a
/// matching echo, a sequence collision with a different command, or a
/// controller shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoOutcome {
    Ack,
    Mismatch,
    Cancelled,
}

impl DeviceController {
    /// Open the transport, restore today's statistics, and start the
    /// event-routing and heartbeat background tasks.
    pub fn open(
        serial: crate::config::SerialConfig,
        config: ControllerConfig,
        stats_store: StatsStore,
        clock: SharedClock,
        callbacks: Callbacks,
    ) -> Arc<Self> {
        let (transport, frame_rx) = Transport::open(serial, None);
        let today = stats_store.load(clock.now()).unwrap_or_default();
        let (shutdown_tx, _) = watch::channel(false);

        let controller = Arc::new(Self {
            transport,
            sequence: AtomicU16::new(1),
            busy: parking_lot::Mutex::new(HashSet::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            stats: parking_lot::Mutex::new(today),
            stats_store,
            callbacks,
            config,
            clock,
            shutdown: shutdown_tx,
        });

        tokio::spawn(controller.clone().run_event_loop(frame_rx));
        tokio::spawn(controller.clone().run_heartbeat());
        controller
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn statistics(&self) -> DeviceStatistics {
        *self.stats.lock()
    }

    /// Stop the heartbeat and event-routing loops, close the transport,
    /// and fail every outstanding echo wait with `Cancelled` (spec §5).
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for (_, (_, tx)) in self.pending.lock().drain() {
            let _ = tx.send(EchoOutcome::Cancelled);
        }
        self.transport.shutdown();
    }

    /// Host sequence numbers are forced odd (spec §4.3): start at 1,
    /// step by 2, and the counter wraps without ever landing on an even
    /// value.
    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(2, Ordering::Relaxed)
    }

    pub async fn dispense(&self, count: u16, speed: u8) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::dispense(count, speed)?).await?;
        self.update_stats(|s| s.coins_dispensed += count as u64);
        Ok(())
    }

    pub async fn refund(&self, count: u16) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::refund(count)?).await?;
        self.update_stats(|s| s.coins_refunded += count as u64);
        Ok(())
    }

    pub async fn ticket_print(&self, count: u16) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::ticket_print(count)?).await?;
        self.update_stats(|s| s.tickets_printed += count as u64);
        Ok(())
    }

    pub async fn push(&self, action: PushAction) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::push(action)).await
    }

    pub async fn light(&self, pattern: u8) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::light(pattern)).await
    }

    pub async fn status_query(&self) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::status_query()).await
    }

    pub async fn fault_recovery(&self) -> Result<(), ControllerError> {
        self.send_with_ack(HostCommand::fault_recovery()).await?;
        self.update_stats(|s| s.recoveries += 1);
        Ok(())
    }

    /// Reserve the command's resource (if any), send it, and wait for
    /// the device's echo using the generic echo timeout. Releases the
    /// reservation whether the command succeeds, times out, or the
    /// transport rejects it outright.
    async fn send_with_ack(&self, cmd: HostCommand) -> Result<(), ControllerError> {
        self.dispatch(cmd, self.config.echo_timeout).await
    }

    /// Same as `send_with_ack`, but with a caller-chosen echo timeout —
    /// the heartbeat exchange uses `ControllerConfig::heartbeat_timeout`
    /// instead of the generic `echo_timeout` (spec §4.3).
    async fn dispatch(&self, cmd: HostCommand, timeout: Duration) -> Result<(), ControllerError> {
        if let Some(resource) = cmd.resource {
            let mut busy = self.busy.lock();
            if busy.contains(&resource) {
                return Err(ControllerError::ResourceBusy(resource));
            }
            busy.insert(resource);
        }

        let result = self.send_and_wait_echo(&cmd, timeout).await;

        if let Some(resource) = cmd.resource {
            self.busy.lock().remove(&resource);
        }
        result
    }

    async fn send_and_wait_echo(&self, cmd: &HostCommand, timeout: Duration) -> Result<(), ControllerError> {
        let sequence = self.next_sequence();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(sequence, (cmd.code, tx));

        if let Err(e) = self.transport.write_frame(cmd.code, sequence, &cmd.payload).await {
            self.pending.lock().remove(&sequence);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(EchoOutcome::Ack)) => Ok(()),
            Ok(Ok(EchoOutcome::Mismatch)) => Err(ControllerError::EchoMismatch),
            Ok(Ok(EchoOutcome::Cancelled)) => Err(ControllerError::Cancelled),
            Ok(Err(_)) => Err(ControllerError::Cancelled),
            Err(_) => {
                self.pending.lock().remove(&sequence);
                Err(ControllerError::EchoTimeout)
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let ts = self.clock.now().timestamp().max(0) as u32;
                    if let Err(e) = self.dispatch(HostCommand::heartbeat(ts), self.config.heartbeat_timeout).await {
                        warn!(error = %e, "heartbeat exchange failed");
                    }
                }
            }
        }
        debug!("heartbeat loop stopped on shutdown");
    }

    async fn run_event_loop(self: Arc<Self>, mut frame_rx: mpsc::Receiver<Frame>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    self.clone().route_frame(frame).await;
                }
            }
        }
        debug!("device event loop ended");
    }

    /// Resolve a waiting echo by sequence, or treat the frame as an
    /// inbound device event: acknowledge it with an echo frame of its
    /// own before updating statistics or firing the callback, so the
    /// ack-then-persist ordering in spec §5 holds for every event kind.
    async fn route_frame(self: Arc<Self>, frame: Frame) {
        if let Some((expected_command, tx)) = self.pending.lock().remove(&frame.sequence) {
            let outcome = if expected_command == frame.command {
                EchoOutcome::Ack
            } else {
                EchoOutcome::Mismatch
            };
            let _ = tx.send(outcome);
            return;
        }

        match events::parse(&frame) {
            Ok(event) => {
                self.ack_event(&frame).await;
                self.clone().handle_event(event).await;
            }
            Err(e) => warn!(error = %e, command = frame.command, "unparseable device event"),
        }
    }

    /// Echo an inbound event back to the device. The device originates
    /// even sequence numbers, so the ack simply reuses the inbound
    /// frame's own command and sequence (spec §4.3 step (a)).
    async fn ack_event(&self, frame: &Frame) {
        if let Err(e) = self.transport.write_frame(frame.command, frame.sequence, &[]).await {
            warn!(error = %e, command = frame.command, "failed to acknowledge device event");
        }
    }

    async fn handle_event(self: Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::CoinInserted { count } => {
                self.update_stats(|s| s.coins_inserted += count as u64);
                self.fire(&self.callbacks.on_coin_inserted, count);
            }
            DeviceEvent::CoinReturned { direction, count } => {
                self.update_stats(|s| match direction {
                    ReturnDirection::Front => s.coins_returned_front += count as u64,
                    ReturnDirection::Left => s.coins_returned_left += count as u64,
                    ReturnDirection::Right => s.coins_returned_right += count as u64,
                });
                if let Some(cb) = self.callbacks.on_coin_returned.clone() {
                    tokio::spawn(async move { cb(direction, count) });
                }
            }
            DeviceEvent::ButtonPressed { button_id } => {
                self.fire(&self.callbacks.on_button_pressed, button_id);
            }
            DeviceEvent::SensorTriggered { kind, value } => {
                self.handle_sensor(kind, value).await;
            }
            DeviceEvent::StatusReport { raw } => {
                if let Some(cb) = self.callbacks.on_status_report.clone() {
                    tokio::spawn(async move { cb(raw) });
                }
            }
            DeviceEvent::FaultReport { code, level } => {
                self.update_stats(|s| s.faults += 1);
                self.fire_fault(code, level);
            }
            DeviceEvent::Progress { percent } => {
                self.fire(&self.callbacks.on_progress, percent);
            }
        }
    }

    async fn handle_sensor(self: &Arc<Self>, kind: SensorKind, value: u16) {
        let Some(outcome) = sensors::evaluate(kind, value) else {
            return;
        };
        self.update_stats(|s| s.faults += 1);
        self.fire_fault(outcome.code, outcome.level);

        if outcome.side_effect == SensorSideEffect::PushStop {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.push(PushAction::Stop).await {
                    warn!(error = %e, "failed to stop push actuator after over-temperature fault");
                }
            });
        }
    }

    fn fire_fault(&self, code: FaultCode, level: FaultLevel) {
        if let Some(cb) = self.callbacks.on_fault.clone() {
            tokio::spawn(async move { cb(code, level) });
        }
    }

    fn fire<T: Send + 'static>(&self, slot: &Option<Arc<dyn Fn(T) + Send + Sync>>, arg: T) {
        if let Some(cb) = slot.clone() {
            tokio::spawn(async move { cb(arg) });
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut DeviceStatistics)) {
        let snapshot = {
            let mut stats = self.stats.lock();
            f(&mut stats);
            *stats
        };
        let store = self.stats_store.clone();
        let at = self.clock.now();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.save(&snapshot, at) {
                warn!(error = %e, "failed to persist device statistics");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_always_odd() {
        let seq = AtomicU16::new(1);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(seq.fetch_add(2, Ordering::Relaxed));
        }
        assert_eq!(seen, vec![1, 3, 5, 7, 9]);
        assert!(seen.iter().all(|s| s % 2 == 1));
    }

    // S6 — echo acknowledgement. Exercises the same pending-map /
    // timeout contract as `send_and_wait_echo` without a real serial
    // port: register a waiter keyed by sequence alone, have a simulated
    // device reply after a short delay with the matching command, and
    // confirm the call resolves inside one timeout window with the map
    // left empty.
    #[tokio::test]
    async fn echo_within_timeout_resolves_and_clears_pending_map() {
        let pending: Arc<parking_lot::Mutex<HashMap<u16, (u8, oneshot::Sender<EchoOutcome>)>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let command = crate::protocol::commands::CMD_DISPENSE;
        let sequence = 1u16;

        let (tx, rx) = oneshot::channel();
        pending.lock().insert(sequence, (command, tx));

        let echo_pending = pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if let Some((expected, waiter)) = echo_pending.lock().remove(&sequence) {
                let outcome = if expected == command { EchoOutcome::Ack } else { EchoOutcome::Mismatch };
                let _ = waiter.send(outcome);
            }
        });

        let result = tokio::time::timeout(std::time::Duration::from_secs(3), rx).await;
        assert!(result.is_ok(), "echo must resolve within the timeout window");
        assert_eq!(result.unwrap().unwrap(), EchoOutcome::Ack);
        assert!(pending.lock().is_empty(), "pending-command map must be empty after the echo");
    }

    // Same sequence as above, but the device echoes a different command
    // than the one the host is waiting on: matched by sequence alone, the
    // waiter must observe a mismatch rather than silently resolving.
    #[tokio::test]
    async fn echo_with_wrong_command_reports_mismatch() {
        let pending: Arc<parking_lot::Mutex<HashMap<u16, (u8, oneshot::Sender<EchoOutcome>)>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let sent_command = crate::protocol::commands::CMD_DISPENSE;
        let echoed_command = crate::protocol::commands::CMD_REFUND;
        let sequence = 1u16;

        let (tx, rx) = oneshot::channel();
        pending.lock().insert(sequence, (sent_command, tx));

        if let Some((expected, waiter)) = pending.lock().remove(&sequence) {
            let outcome = if expected == echoed_command { EchoOutcome::Ack } else { EchoOutcome::Mismatch };
            let _ = waiter.send(outcome);
        }

        assert_eq!(rx.await.unwrap(), EchoOutcome::Mismatch);
    }

    // Controller shutdown must fail every outstanding echo wait with
    // `Cancelled` rather than leaving it to time out.
    #[tokio::test]
    async fn shutdown_cancels_pending_echoes() {
        let pending: Arc<parking_lot::Mutex<HashMap<u16, (u8, oneshot::Sender<EchoOutcome>)>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(1, (crate::protocol::commands::CMD_DISPENSE, tx));

        for (_, (_, waiter)) in pending.lock().drain() {
            let _ = waiter.send(EchoOutcome::Cancelled);
        }

        assert_eq!(rx.await.unwrap(), EchoOutcome::Cancelled);
        assert!(pending.lock().is_empty());
    }

    // The heartbeat timeout is a distinct, longer window than the
    // generic echo timeout (spec §4.3): dispatch must use the former for
    // heartbeats rather than silently falling back to the latter.
    #[test]
    fn heartbeat_timeout_differs_from_echo_timeout() {
        let config = ControllerConfig::default();
        assert_eq!(config.echo_timeout, Duration::from_secs(3));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_ne!(config.echo_timeout, config.heartbeat_timeout);
    }
}
