//! Reconnect behaviour of the serial transport over in-memory ports.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use terps_host::hardware::{DynSerial, SerialOpener, SerialTransport, TransportConfig};
use terps_host::protocol::{encode_frame, Frame, FrameFormat, OperatingMode, FRAME_LEN};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Hands out a scripted sequence of ports; `None` entries (and an empty script)
/// fail the open.
struct ScriptedOpener {
    ports: Mutex<VecDeque<Option<DuplexStream>>>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl SerialOpener for ScriptedOpener {
    async fn open(&self) -> anyhow::Result<DynSerial> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.ports.lock().unwrap().pop_front() {
            Some(Some(port)) => Ok(Box::new(port)),
            _ => anyhow::bail!("port unavailable"),
        }
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

fn frame(ts_ms: f64) -> Frame {
    Frame {
        ts_ms,
        f_hz: 30_012.3456,
        tau_ms: 100.0,
        v_uv: 600_100.0,
        adc_gain: 16,
        flags: 0x01,
        ppm_corr: -1.25,
        mode: OperatingMode::Recip,
    }
}

fn binary_config() -> TransportConfig {
    TransportConfig {
        frame_format: FrameFormat::Binary,
        read_timeout: Duration::from_millis(50),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
        chunk_size: 7,
    }
}

#[tokio::test]
async fn first_open_fails_then_frames_flow() {
    let (mut device, host) = tokio::io::duplex(4096);
    let attempts = Arc::new(AtomicUsize::new(0));
    let opener = ScriptedOpener {
        ports: Mutex::new(VecDeque::from([None, Some(host)])),
        attempts: attempts.clone(),
    };
    let (frame_tx, mut frame_rx) = mpsc::channel(16);
    let (transport, handle) = SerialTransport::new(binary_config(), Box::new(opener), frame_tx);
    let task = tokio::spawn(transport.run());

    assert!(handle.wait_ready(Duration::from_secs(2)).await);

    let mut bytes = encode_frame(&frame(1.0));
    bytes.extend_from_slice(&encode_frame(&frame(2.0)));
    device.write_all(&bytes).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.ts_ms, 1.0);
    assert_eq!(second.ts_ms, 2.0);
    assert!((second.f_hz - 30_012.3456).abs() < 1e-4);
    assert!((second.ppm_corr + 1.25).abs() < 1e-2);

    let stats = handle.stats();
    assert!(stats.reconnects >= 1);
    assert_eq!(stats.frames, 2);
    assert!(attempts.load(Ordering::SeqCst) >= 2);

    handle.shutdown();
    let final_stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_stats.frames, 2);
    assert_eq!(final_stats.crc_errors, 0);
}

#[tokio::test]
async fn partial_frame_is_discarded_on_reconnect() {
    let (mut first_device, first_host) = tokio::io::duplex(4096);
    let (mut second_device, second_host) = tokio::io::duplex(4096);
    let opener = ScriptedOpener {
        ports: Mutex::new(VecDeque::from([Some(first_host), Some(second_host)])),
        attempts: Arc::new(AtomicUsize::new(0)),
    };
    let (frame_tx, mut frame_rx) = mpsc::channel(16);
    let (transport, handle) = SerialTransport::new(binary_config(), Box::new(opener), frame_tx);
    let task = tokio::spawn(transport.run());
    assert!(handle.wait_ready(Duration::from_secs(2)).await);

    // Half a frame, then the link drops.
    let partial = encode_frame(&frame(1.0));
    first_device
        .write_all(&partial[..FRAME_LEN / 2])
        .await
        .unwrap();
    drop(first_device);

    // The tail of that frame must not be glued onto the new connection's bytes.
    second_device
        .write_all(&partial[FRAME_LEN / 2..])
        .await
        .unwrap();
    second_device
        .write_all(&encode_frame(&frame(3.0)))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.ts_ms, 3.0);

    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.frames, 1);
    assert!(stats.reconnects >= 1);
}

#[tokio::test]
async fn shutdown_interrupts_backoff() {
    let opener = ScriptedOpener {
        ports: Mutex::new(VecDeque::new()),
        attempts: Arc::new(AtomicUsize::new(0)),
    };
    let config = TransportConfig {
        reconnect_initial: Duration::from_secs(30),
        reconnect_max: Duration::from_secs(30),
        ..binary_config()
    };
    let (frame_tx, _frame_rx) = mpsc::channel(4);
    let (transport, handle) = SerialTransport::new(config, Box::new(opener), frame_tx);
    let task = tokio::spawn(transport.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_ready());
    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.reconnects, 1);
}
