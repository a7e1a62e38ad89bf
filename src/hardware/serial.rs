//! Serial port abstractions for the device link.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SerialOpener`]: How the transport (re)opens its port
//!
//! Openers:
//!
//! - [`TokioSerialOpener`]: a real serial device via `tokio-serial` (feature `serial`)
//! - [`StdinOpener`]: reads the stream from standard input, single-shot
//!
//! Tests drive the transport through `tokio::io::duplex` pairs.

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`StdinPort`] (replaying a capture through a pipe)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the byte stream the transport runs on.
#[async_trait]
pub trait SerialOpener: Send + Sync {
    /// Open (or reopen) the port.
    async fn open(&self) -> anyhow::Result<DynSerial>;

    /// Name used in logs.
    fn describe(&self) -> String;

    /// Whether the transport should reopen after the stream ends or fails.
    fn reconnects(&self) -> bool {
        true
    }

    /// Whether the far end answers device commands.
    fn accepts_commands(&self) -> bool {
        true
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!("Failed to open serial port: {}", port_path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Opens a serial device by path.
#[derive(Debug, Clone)]
pub struct TokioSerialOpener {
    port: String,
    baud_rate: u32,
}

impl TokioSerialOpener {
    /// Opener for `port` at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl SerialOpener for TokioSerialOpener {
    async fn open(&self) -> anyhow::Result<DynSerial> {
        #[cfg(feature = "serial")]
        {
            let stream = open_serial_async(&self.port, self.baud_rate).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(feature = "serial"))]
        {
            Err(crate::error::TerpsError::FeatureNotEnabled("serial".to_string()).into())
        }
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }
}

/// Standard input as a read-only port; writes are discarded.
pub struct StdinPort {
    stdin: tokio::io::Stdin,
    sink: tokio::io::Sink,
}

impl AsyncRead for StdinPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdinPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.sink).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink).poll_shutdown(cx)
    }
}

/// Single-shot opener over standard input (`--port -`).
#[derive(Debug, Default)]
pub struct StdinOpener {
    opened: AtomicBool,
}

impl StdinOpener {
    /// Create the opener.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SerialOpener for StdinOpener {
    async fn open(&self) -> anyhow::Result<DynSerial> {
        if self.opened.swap(true, Ordering::SeqCst) {
            anyhow::bail!("standard input can only be opened once");
        }
        Ok(Box::new(StdinPort {
            stdin: tokio::io::stdin(),
            sink: tokio::io::sink(),
        }))
    }

    fn describe(&self) -> String {
        "stdin".to_string()
    }

    fn reconnects(&self) -> bool {
        false
    }

    fn accepts_commands(&self) -> bool {
        false
    }
}

/// Build the opener for a `--port` argument (`-` selects standard input).
pub fn opener_for_port(port: &str, baud_rate: u32) -> Box<dyn SerialOpener> {
    if port == "-" {
        Box::new(StdinOpener::new())
    } else {
        Box::new(TokioSerialOpener::new(port, baud_rate))
    }
}
