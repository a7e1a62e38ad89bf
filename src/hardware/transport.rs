//! Serial transport: telemetry and command traffic multiplexed on one link.
//!
//! The transport task owns the port. It reassembles telemetry into frames, pushes
//! them into a bounded queue (dropping on full), and serves request/response
//! commands one at a time.
//!
//! # Connection state machine
//!
//! ```text
//! Connecting ──open ok──> Streaming ──eof / io error──> Connecting (after backoff)
//!     │                      │
//!     └──shutdown──> Closed <┘
//! ```
//!
//! While streaming, the channel itself is either [`ChannelState::Idle`] (lines and
//! bytes are telemetry) or [`ChannelState::AwaitingReply`] (every line belongs to the
//! active command until `END`).

use super::serial::{DynSerial, SerialOpener};
use crate::coeff::CommandExecutor;
use crate::protocol::{Frame, FrameFormat, FrameReassembler};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Line that terminates every command reply.
pub const REPLY_TERMINATOR: &str = "END";

/// Failure of a single device command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No complete reply before the deadline.
    #[error("command timed out")]
    Timeout,

    /// The command could not be written to the port.
    #[error("failed to write command: {0}")]
    WriteFailed(String),

    /// The link is not currently open.
    #[error("device not connected")]
    NotConnected,

    /// The link dropped (or the transport stopped) before the reply completed.
    #[error("device disconnected before reply completed")]
    Disconnected,
}

/// Reply lines of a command, or why there are none.
pub type CommandReply = Result<Vec<String>, CommandError>;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Wire format of the telemetry stream
    pub frame_format: FrameFormat,
    /// Upper bound on a single blocking read
    pub read_timeout: Duration,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
    /// Read size in binary mode
    pub chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame_format: FrameFormat::Csv,
            read_timeout: Duration::from_secs(2),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(5),
            chunk_size: 256,
        }
    }
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Frames decoded
    pub frames: u64,
    /// Binary frames with a bad CRC
    pub crc_errors: u64,
    /// Binary frames with a bad declared length
    pub length_errors: u64,
    /// Text records that failed to decode
    pub decode_errors: u64,
    /// Frames dropped because the queue was full
    pub dropped: u64,
    /// Reconnect attempts scheduled after a failure
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct TransportCounters {
    frames: AtomicU64,
    crc_errors: AtomicU64,
    length_errors: AtomicU64,
    decode_errors: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl TransportCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames: self.frames.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            length_errors: self.length_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn record_reassembly(&self, reassembler: &FrameReassembler) {
        let stats = reassembler.stats();
        self.frames.store(stats.frames, Ordering::Relaxed);
        self.crc_errors.store(stats.crc_errors, Ordering::Relaxed);
        self.length_errors
            .store(stats.length_errors, Ordering::Relaxed);
        self.decode_errors
            .store(stats.decode_errors, Ordering::Relaxed);
    }
}

struct CommandRequest {
    command: String,
    submitted: Instant,
    timeout: Duration,
    reply_tx: oneshot::Sender<CommandReply>,
}

impl CommandRequest {
    fn deadline(&self) -> Instant {
        self.submitted + self.timeout
    }
}

struct ActiveCommand {
    request: CommandRequest,
    lines: Vec<String>,
}

impl ActiveCommand {
    fn complete(self, reply: CommandReply) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.request.reply_tx.send(reply);
    }
}

/// Multiplexing state of an open link.
enum ChannelState {
    Idle,
    AwaitingReply(ActiveCommand),
}

impl ChannelState {
    fn is_idle(&self) -> bool {
        matches!(self, ChannelState::Idle)
    }
}

/// Why a streaming session ended.
#[derive(Debug)]
enum StreamEnd {
    Shutdown,
    Eof,
    Failed(io::Error),
    QueueClosed,
}

enum StreamEvent {
    Shutdown,
    Command(Option<CommandRequest>),
    Read(io::Result<usize>),
    ReadTimeout,
}

/// Cloneable control surface of a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<CommandRequest>,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    counters: Arc<TransportCounters>,
}

impl TransportHandle {
    /// Send `command` and wait for its reply lines (without the `END` terminator).
    ///
    /// Fails immediately with [`CommandError::NotConnected`] when the link is down.
    pub async fn execute(&self, command: &str, timeout: Duration) -> CommandReply {
        if !self.is_ready() {
            return Err(CommandError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommandRequest {
            command: command.to_string(),
            submitted: Instant::now(),
            timeout,
            reply_tx,
        };
        if self.cmd_tx.send(request).is_err() {
            return Err(CommandError::Disconnected);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => Err(CommandError::Timeout),
        }
    }

    /// Whether the link is open.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until the link is open, for at most `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready_rx = self.ready_rx.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    /// Ask the transport task to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[async_trait]
impl CommandExecutor for TransportHandle {
    async fn execute(&self, command: &str, timeout: Duration) -> CommandReply {
        TransportHandle::execute(self, command, timeout).await
    }
}

/// The transport task.
pub struct SerialTransport {
    config: TransportConfig,
    opener: Box<dyn SerialOpener>,
    frame_tx: mpsc::Sender<Frame>,
    cmd_rx: mpsc::UnboundedReceiver<CommandRequest>,
    commands_open: bool,
    ready_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    counters: Arc<TransportCounters>,
    reassembler: FrameReassembler,
}

impl SerialTransport {
    /// Create the transport and its handle. Nothing happens until [`run`](Self::run).
    pub fn new(
        config: TransportConfig,
        opener: Box<dyn SerialOpener>,
        frame_tx: mpsc::Sender<Frame>,
    ) -> (Self, TransportHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(TransportCounters::default());

        let handle = TransportHandle {
            cmd_tx,
            ready_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            counters: counters.clone(),
        };
        let transport = Self {
            config,
            opener,
            frame_tx,
            cmd_rx,
            commands_open: true,
            ready_tx,
            shutdown_rx,
            counters,
            reassembler: FrameReassembler::new(),
        };
        (transport, handle)
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until shutdown, until a single-shot source ends, or until the frame
    /// queue's consumer goes away. Returns the final counters.
    pub async fn run(mut self) -> TransportStats {
        let mut backoff = self.config.reconnect_initial;
        let source = self.opener.describe();

        loop {
            if self.shutdown_requested() {
                break;
            }

            let opened = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                opened = self.opener.open() => opened,
            };

            match opened {
                Ok(port) => {
                    info!(source = %source, "Device link open");
                    backoff = self.config.reconnect_initial;
                    self.reassembler.reset();
                    self.ready_tx.send_replace(true);

                    let end = self.stream(port).await;
                    self.ready_tx.send_replace(false);

                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::QueueClosed => {
                            debug!("Frame consumer gone, stopping transport");
                            break;
                        }
                        StreamEnd::Eof if !self.opener.reconnects() => {
                            info!(source = %source, "Input stream ended");
                            break;
                        }
                        StreamEnd::Eof => warn!(source = %source, "Device link closed"),
                        StreamEnd::Failed(err) => {
                            warn!(source = %source, error = %err, "Device link failed")
                        }
                    }
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "Failed to open device link");
                }
            }

            if !self.opener.reconnects() {
                break;
            }

            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            let delay = backoff.min(self.config.reconnect_max);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }

        self.ready_tx.send_replace(false);
        self.drain_commands();
        self.counters.record_reassembly(&self.reassembler);
        self.counters.snapshot()
    }

    fn drain_commands(&mut self) {
        self.cmd_rx.close();
        while let Ok(request) = self.cmd_rx.try_recv() {
            let _ = request.reply_tx.send(Err(CommandError::Disconnected));
        }
    }

    async fn stream(&mut self, port: DynSerial) -> StreamEnd {
        let mut reader = BufReader::new(port);
        let mut line_buf: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let mut state = ChannelState::Idle;

        let end = loop {
            if self.shutdown_requested() {
                break StreamEnd::Shutdown;
            }

            let now = Instant::now();
            let expired = matches!(
                &state,
                ChannelState::AwaitingReply(active) if now >= active.request.deadline()
            );
            if expired {
                if let ChannelState::AwaitingReply(active) =
                    std::mem::replace(&mut state, ChannelState::Idle)
                {
                    debug!(command = %active.request.command, "Command timed out");
                    active.complete(Err(CommandError::Timeout));
                }
                if !self.release_partial_line(&mut line_buf) {
                    break StreamEnd::QueueClosed;
                }
            }

            let can_dequeue = state.is_idle() && line_buf.is_empty();
            if can_dequeue {
                match self.dequeue_pending(reader.get_mut()).await {
                    Ok(Some(active)) => state = ChannelState::AwaitingReply(active),
                    Ok(None) => {}
                    Err(err) => break StreamEnd::Failed(err),
                }
            }

            let line_mode =
                self.config.frame_format == FrameFormat::Csv || !state.is_idle();
            let wait = match &state {
                ChannelState::AwaitingReply(active) => self
                    .config
                    .read_timeout
                    .min(active.request.deadline().saturating_duration_since(now)),
                ChannelState::Idle => self.config.read_timeout,
            };
            let accept_commands = state.is_idle() && line_buf.is_empty() && self.commands_open;

            let event = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => StreamEvent::Shutdown,
                request = self.cmd_rx.recv(), if accept_commands => StreamEvent::Command(request),
                read = tokio::time::timeout(
                    wait,
                    read_unit(&mut reader, line_mode, &mut line_buf, &mut chunk),
                ) => match read {
                    Ok(result) => StreamEvent::Read(result),
                    Err(_) => StreamEvent::ReadTimeout,
                },
            };

            match event {
                StreamEvent::Shutdown => break StreamEnd::Shutdown,
                StreamEvent::ReadTimeout => {}
                StreamEvent::Command(None) => self.commands_open = false,
                StreamEvent::Command(Some(request)) => {
                    match start_command(reader.get_mut(), request).await {
                        Ok(Some(active)) => state = ChannelState::AwaitingReply(active),
                        Ok(None) => {}
                        Err(err) => break StreamEnd::Failed(err),
                    }
                }
                StreamEvent::Read(Err(err)) => break StreamEnd::Failed(err),
                StreamEvent::Read(Ok(0)) => break StreamEnd::Eof,
                StreamEvent::Read(Ok(n)) => {
                    let delivered = if line_mode {
                        let line = String::from_utf8_lossy(&line_buf).into_owned();
                        line_buf.clear();
                        self.handle_line(&line, &mut state)
                    } else {
                        let frames = self.reassembler.push_bytes(&chunk[..n]);
                        self.counters.record_reassembly(&self.reassembler);
                        self.deliver(frames)
                    };
                    if !delivered {
                        break StreamEnd::QueueClosed;
                    }
                }
            }
        };

        if let ChannelState::AwaitingReply(active) = state {
            active.complete(Err(CommandError::Disconnected));
        }
        self.counters.record_reassembly(&self.reassembler);
        end
    }

    /// Hand bytes read while a reply was pending back to the binary reassembler.
    ///
    /// A text stream keeps its partial line: the rest of it is still telemetry.
    fn release_partial_line(&mut self, line_buf: &mut Vec<u8>) -> bool {
        if self.config.frame_format == FrameFormat::Csv || line_buf.is_empty() {
            return true;
        }
        debug!(bytes = line_buf.len(), "Returning unterminated reply bytes to the frame scanner");
        let frames = self.reassembler.push_bytes(line_buf);
        line_buf.clear();
        self.counters.record_reassembly(&self.reassembler);
        self.deliver(frames)
    }

    async fn dequeue_pending(&mut self, port: &mut DynSerial) -> io::Result<Option<ActiveCommand>> {
        while let Ok(request) = self.cmd_rx.try_recv() {
            if let Some(active) = start_command(port, request).await? {
                return Ok(Some(active));
            }
        }
        Ok(None)
    }

    /// Route one line. Returns false once the frame consumer is gone.
    fn handle_line(&mut self, raw: &str, state: &mut ChannelState) -> bool {
        let line = raw.trim();
        if !state.is_idle() {
            if line == REPLY_TERMINATOR {
                if let ChannelState::AwaitingReply(mut active) =
                    std::mem::replace(state, ChannelState::Idle)
                {
                    debug!(
                        command = %active.request.command,
                        lines = active.lines.len(),
                        "Command reply complete"
                    );
                    let lines = std::mem::take(&mut active.lines);
                    active.complete(Ok(lines));
                }
            } else if !line.is_empty() {
                if let ChannelState::AwaitingReply(active) = state {
                    active.lines.push(line.to_string());
                }
            }
            return true;
        }

        let result = self.reassembler.push_line(line);
        self.counters.record_reassembly(&self.reassembler);
        match result {
            Ok(Some(frame)) => self.deliver(vec![frame]),
            Ok(None) => true,
            Err(err) => {
                debug!(error = %err, line, "Discarding malformed record");
                true
            }
        }
    }

    fn deliver(&self, frames: Vec<Frame>) -> bool {
        for frame in frames {
            match self.frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

async fn read_unit(
    reader: &mut BufReader<DynSerial>,
    line_mode: bool,
    line_buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> io::Result<usize> {
    if line_mode {
        reader.read_until(b'\n', line_buf).await
    } else {
        reader.read(chunk).await
    }
}

/// Write a queued request, unless it is stale. `Err` means the port is unusable.
async fn start_command(
    port: &mut DynSerial,
    request: CommandRequest,
) -> io::Result<Option<ActiveCommand>> {
    if request.reply_tx.is_closed() {
        debug!(command = %request.command, "Skipping command abandoned by caller");
        return Ok(None);
    }
    if Instant::now() >= request.deadline() {
        let _ = request.reply_tx.send(Err(CommandError::Timeout));
        return Ok(None);
    }

    let mut wire = request.command.clone().into_bytes();
    wire.push(b'\n');
    let written = match port.write_all(&wire).await {
        Ok(()) => port.flush().await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        let _ = request
            .reply_tx
            .send(Err(CommandError::WriteFailed(err.to_string())));
        return Err(err);
    }

    debug!(command = %request.command, "Command sent");
    Ok(Some(ActiveCommand {
        request,
        lines: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::serial::SerialOpener;
    use crate::protocol::{encode_frame, OperatingMode};
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct OneShotDuplex {
        port: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl SerialOpener for OneShotDuplex {
        async fn open(&self) -> anyhow::Result<DynSerial> {
            match self.port.lock().unwrap().take() {
                Some(port) => Ok(Box::new(port)),
                None => anyhow::bail!("already opened"),
            }
        }

        fn describe(&self) -> String {
            "duplex".into()
        }

        fn reconnects(&self) -> bool {
            false
        }
    }

    type Spawned = (
        DuplexStream,
        TransportHandle,
        mpsc::Receiver<Frame>,
        tokio::task::JoinHandle<TransportStats>,
    );

    fn spawn_text_transport(capacity: usize) -> Spawned {
        spawn_transport(FrameFormat::Csv, capacity)
    }

    fn spawn_transport(frame_format: FrameFormat, capacity: usize) -> Spawned {
        let (device, host) = tokio::io::duplex(4096);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let config = TransportConfig {
            frame_format,
            read_timeout: Duration::from_millis(50),
            ..TransportConfig::default()
        };
        let opener = OneShotDuplex {
            port: Mutex::new(Some(host)),
        };
        let (transport, handle) = SerialTransport::new(config, Box::new(opener), frame_tx);
        let task = tokio::spawn(transport.run());
        (device, handle, frame_rx, task)
    }

    const RECORD: &str = "1,30000.0,100,600000,16,0,0.0,RECIP\n";

    fn binary_frame(ts_ms: f64) -> Vec<u8> {
        encode_frame(&Frame {
            ts_ms,
            f_hz: 30_000.0,
            tau_ms: 100.0,
            v_uv: 600_000.0,
            adc_gain: 16,
            flags: 0,
            ppm_corr: 0.0,
            mode: OperatingMode::Recip,
        })
    }

    #[tokio::test]
    async fn command_reply_is_captured_between_telemetry() {
        let (device, handle, mut frames, task) = spawn_text_transport(16);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        let (device_rx, mut device_tx) = tokio::io::split(device);
        device_tx.write_all(RECORD.as_bytes()).await.unwrap();
        assert!(frames.recv().await.is_some());

        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(device_rx).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            assert_eq!(command, "INFO.DEV");
            device_tx
                .write_all(b"OK DEV=0xA2\nREV=3\nEND\n")
                .await
                .unwrap();
            device_tx.write_all(RECORD.as_bytes()).await.unwrap();
            device_tx
        });

        let reply = handle
            .execute("INFO.DEV", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec!["OK DEV=0xA2".to_string(), "REV=3".to_string()]);
        assert!(frames.recv().await.is_some());

        let _device = responder.await.unwrap();
        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.decode_errors, 0);
    }

    #[tokio::test]
    async fn command_times_out_without_end() {
        let (device, handle, _frames, task) = spawn_text_transport(16);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        let err = handle
            .execute("EEPROM.DUMP 0 512", Duration::from_millis(150))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);

        handle.shutdown();
        task.await.unwrap();
        drop(device);
    }

    #[tokio::test]
    async fn disconnect_fails_active_command() {
        let (device, handle, _frames, task) = spawn_text_transport(16);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        let (device_rx, device_tx) = tokio::io::split(device);
        let dropper = tokio::spawn(async move {
            let mut lines = BufReader::new(device_rx).lines();
            let _ = lines.next_line().await;
            drop(device_tx);
            drop(lines);
        });

        let err = handle
            .execute("EEPROM.DUMP 0 512", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Disconnected);
        dropper.await.unwrap();
        task.await.unwrap();
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn not_connected_before_open() {
        let (frame_tx, _frame_rx) = mpsc::channel(4);
        let opener = OneShotDuplex {
            port: Mutex::new(None),
        };
        let (_transport, handle) =
            SerialTransport::new(TransportConfig::default(), Box::new(opener), frame_tx);
        assert_eq!(
            handle.execute("INFO.DEV", Duration::from_millis(10)).await,
            Err(CommandError::NotConnected)
        );
    }

    #[tokio::test]
    async fn full_queue_drops_frames() {
        let (mut device, handle, mut frames, task) = spawn_text_transport(1);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        for _ in 0..3 {
            device.write_all(RECORD.as_bytes()).await.unwrap();
        }
        drop(device);
        let stats = task.await.unwrap();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.dropped, 2);
        assert!(frames.recv().await.is_some());
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_reply_is_read_as_lines_and_frames_resume() {
        let (device, handle, mut frames, task) = spawn_transport(FrameFormat::Binary, 16);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        let (device_rx, mut device_tx) = tokio::io::split(device);
        device_tx.write_all(&binary_frame(1.0)).await.unwrap();
        assert_eq!(frames.recv().await.unwrap().ts_ms, 1.0);

        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(device_rx).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            assert_eq!(command, "INFO.DEV");
            device_tx.write_all(b"OK DEV=0xA2\nEND\n").await.unwrap();
            device_tx.write_all(&binary_frame(2.0)).await.unwrap();
            device_tx
        });

        let reply = handle
            .execute("INFO.DEV", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec!["OK DEV=0xA2".to_string()]);
        assert_eq!(frames.recv().await.unwrap().ts_ms, 2.0);

        let _device = responder.await.unwrap();
        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.crc_errors, 0);
    }

    #[tokio::test]
    async fn binary_command_after_unterminated_reply_is_still_sent() {
        let (device, handle, mut frames, task) = spawn_transport(FrameFormat::Binary, 16);
        assert!(handle.wait_ready(Duration::from_secs(1)).await);

        let (device_rx, mut device_tx) = tokio::io::split(device);
        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(device_rx).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "EEPROM.DUMP 0 512");
            // no newline: the reply never completes
            device_tx.write_all(&[0xAA, 0x55, 0x01, 0x02]).await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "INFO.DEV");
            device_tx.write_all(b"OK\nEND\n").await.unwrap();
            device_tx.write_all(&binary_frame(3.0)).await.unwrap();
            device_tx
        });

        let err = handle
            .execute("EEPROM.DUMP 0 512", Duration::from_millis(150))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);

        let reply = handle
            .execute("INFO.DEV", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec!["OK".to_string()]);
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.ts_ms, 3.0);

        let _device = responder.await.unwrap();
        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.frames, 1);
    }
}
