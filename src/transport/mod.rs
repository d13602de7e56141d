//! Serial transport: owns the OS serial handle, hides disconnect/reconnect
//! from callers, and exposes a framed read/write surface (spec §4.2).
//!
//! Grounded on `scrapers/binance_session.rs`'s `SessionConfig` /
//! `BackoffCalculator` (degradation knobs, attempt counter, reset-on-success)
//! and `edge/receiver.rs`'s `Arc<AtomicU64>` stats counters, adapted from a
//! WebSocket session to a single-owner serial actor task.

mod backoff;

use crate::config::SerialConfig;
use crate::protocol::frame::{self, Frame, MIN_FRAME_LEN};
use backoff::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NotConnected,
    Cancelled,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "transport is not connected"),
            Self::Cancelled => write!(f, "transport call cancelled on shutdown"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Hook invoked after a successful reopen, before clients resume writing.
pub type OnReconnect = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
pub struct TransportStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frame_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

struct WriteRequest {
    bytes: Vec<u8>,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

/// A connected serial transport. One background task owns the physical
/// handle end to end (reads, writes, and reconnects) so frames on the
/// wire stay totally ordered per direction without an explicit lock
/// (spec §5): a single writer, a single reader.
pub struct Transport {
    write_tx: mpsc::Sender<WriteRequest>,
    connected: Arc<AtomicBool>,
    pub stats: Arc<TransportStats>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Open the transport and spawn its owning task. Returns the
    /// transport handle plus the inbound frame stream.
    pub fn open(config: SerialConfig, on_reconnect: Option<OnReconnect>) -> (Self, mpsc::Receiver<Frame>) {
        let (write_tx, write_rx) = mpsc::channel(64);
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TransportStats::default());

        tokio::spawn(run_actor(
            config,
            write_rx,
            frame_tx,
            shutdown_rx,
            connected.clone(),
            stats.clone(),
            on_reconnect,
        ));

        (
            Self {
                write_tx,
                connected,
                stats,
                shutdown: shutdown_tx,
            },
            frame_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Serialize a frame onto the wire. Fails immediately with
    /// `NotConnected` during a disconnected interval (spec §4.2).
    pub async fn write_frame(&self, command: u8, sequence: u16, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let bytes = frame::encode(command, sequence, payload).map_err(|_| TransportError::NotConnected)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .write_tx
            .send(WriteRequest { bytes, ack: ack_tx })
            .await
            .is_err()
        {
            return Err(TransportError::NotConnected);
        }
        ack_rx.await.unwrap_or(Err(TransportError::Cancelled))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn discover_port(pattern: &str, last_good: &Option<String>) -> Option<String> {
    let ports = serialport::available_ports().unwrap_or_default();
    if let Some(last) = last_good {
        if ports.iter().any(|p| &p.port_name == last) {
            return Some(last.clone());
        }
    }
    if pattern == "auto" {
        return ports.into_iter().next().map(|p| p.port_name);
    }
    if ports.iter().any(|p| p.port_name == pattern) {
        return Some(pattern.to_string());
    }
    ports
        .into_iter()
        .find(|p| p.port_name.contains(pattern))
        .map(|p| p.port_name)
}

fn build_port(path: &str, config: &SerialConfig) -> tokio_serial::Result<tokio_serial::SerialStream> {
    let parity = if config.parity_odd {
        tokio_serial::Parity::Odd
    } else {
        tokio_serial::Parity::None
    };
    let stop_bits = if config.stop_bits >= 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    };
    let data_bits = match config.data_bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    tokio_serial::new(path, config.baud)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits)
        .open_native_async()
}

/// Whether an I/O error is severe enough to trigger reconnect. Benign
/// errors (read timeout, EOF on USB-CDC) are swallowed in the read loop
/// instead (spec §4.2).
fn is_fatal_io_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::Other
    )
}

#[allow(clippy::too_many_arguments)]
async fn run_actor(
    config: SerialConfig,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    frame_tx: mpsc::Sender<Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    on_reconnect: Option<OnReconnect>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
    let mut last_good_path: Option<String> = None;
    let mut read_buf = Vec::<u8>::new();
    let mut chunk = [0u8; 1024];

    'outer: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let path = match discover_port(&config.port, &last_good_path) {
            Some(p) => p,
            None => {
                warn!("no serial port matched pattern {:?}, retrying", config.port);
                if wait_backoff(&mut backoff, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        let mut port = match build_port(&path, &config) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, path = %path, "failed to open serial port");
                if wait_backoff(&mut backoff, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        info!(path = %path, "serial transport connected");
        last_good_path = Some(path);
        connected.store(true, Ordering::Release);
        backoff.reset();
        if let Some(hook) = &on_reconnect {
            hook();
        }
        read_buf.clear();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        connected.store(false, Ordering::Release);
                        break 'outer;
                    }
                }

                req = write_rx.recv() => {
                    let Some(req) = req else { break 'outer; };
                    let result = port.write_all(&req.bytes).await;
                    match result {
                        Ok(()) => {
                            stats.bytes_written.fetch_add(req.bytes.len() as u64, Ordering::Relaxed);
                            let _ = req.ack.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = req.ack.send(Err(TransportError::NotConnected));
                            if is_fatal_io_error(&e) {
                                error!(error = %e, "write error, scheduling reconnect");
                                connected.store(false, Ordering::Release);
                                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }

                n = port.read(&mut chunk) => {
                    match n {
                        Ok(0) => {
                            // Benign EOF (common on USB-CDC re-enumeration); keep reading.
                            continue;
                        }
                        Ok(n) => {
                            stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                            read_buf.extend_from_slice(&chunk[..n]);
                            drain_frames(&mut read_buf, &frame_tx, &stats).await;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            continue;
                        }
                        Err(e) => {
                            if is_fatal_io_error(&e) {
                                error!(error = %e, "read error, scheduling reconnect");
                                connected.store(false, Ordering::Release);
                                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }
}

/// Resynchronize by scanning to the next header byte, decode complete
/// frames, discard one byte and retry on codec rejection (spec §4.2).
async fn drain_frames(buf: &mut Vec<u8>, frame_tx: &mpsc::Sender<Frame>, stats: &TransportStats) {
    loop {
        let Some(start) = buf.iter().position(|&b| b == frame::HEADER) else {
            buf.clear();
            return;
        };
        if start > 0 {
            buf.drain(..start);
        }
        if buf.len() < MIN_FRAME_LEN {
            return;
        }
        let declared_len = buf[1] as usize;
        if buf.len() < declared_len {
            // Header and length byte arrived but the rest of the frame
            // hasn't; wait for more bytes instead of handing the codec a
            // frame it can only reject as truncated (spec §4.2).
            return;
        }
        match frame::decode(buf) {
            Ok((frame, consumed)) => {
                buf.drain(..consumed);
                stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                let _ = frame_tx.send(frame).await;
            }
            Err(_) => {
                stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                buf.remove(0);
            }
        }
    }
}

async fn wait_backoff(backoff: &mut Backoff, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next();
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}
