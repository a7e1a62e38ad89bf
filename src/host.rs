//! Host orchestrator.
//!
//! Wires the pieces together for one acquisition run:
//!
//! ```text
//! SerialTransport ──frames (bounded mpsc)──▶ HostOrchestrator ──▶ SamplePipeline ──▶ SampleLog
//!        ▲                                         │
//!        └──── EEPROM.DUMP (TransportHandle) ◀── CoefficientManager
//! ```
//!
//! The transport runs in its own task. The orchestrator loop consumes frames,
//! ticks the coefficient manager after each one and logs counters periodically.
//! It stops when the shutdown future resolves or the frame source ends.

use crate::coeff::manager::ManagerStats;
use crate::coeff::{CoefficientManager, CoefficientMode, EepromOverCommand, ManualOverride};
use crate::config::{seconds, TerpsConfig};
use crate::data::{AllanWindow, SampleLog, SamplePipeline};
use crate::error::AppResult;
use crate::hardware::{
    opener_for_port, SerialOpener, SerialTransport, TransportHandle, TransportStats,
};
use crate::protocol::Frame;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long one queue receive waits before the loop checks housekeeping.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Samples processed by the pipeline
    pub samples: u64,
    /// Final transport counters
    pub transport: TransportStats,
    /// Coefficient manager counters
    pub coefficients: ManagerStats,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

enum LoopEvent {
    Frame(Frame),
    Idle,
    SourceEnded,
    Shutdown,
}

/// Runs one acquisition session.
pub struct HostOrchestrator {
    config: TerpsConfig,
    opener: Box<dyn SerialOpener>,
}

impl HostOrchestrator {
    /// Orchestrator reading from `opener`. The configuration is validated here.
    pub fn new(config: TerpsConfig, opener: Box<dyn SerialOpener>) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config, opener })
    }

    /// Orchestrator for the configured `serial.port`.
    pub fn from_config(config: TerpsConfig) -> AppResult<Self> {
        let opener = opener_for_port(&config.serial.port, config.serial.baud_rate);
        Self::new(config, opener)
    }

    /// Run until `shutdown` resolves or the frame source ends.
    pub async fn run<F>(self, shutdown: F) -> AppResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let config = self.config;

        // Everything that can fail on bad configuration happens before the port opens.
        let default = config.static_default()?;
        let manual = match &config.coefficients.manual_path {
            Some(path) => ManualOverride::load(path)?,
            None => ManualOverride::new(None),
        };
        let log = config.output_csv.as_ref().map(SampleLog::new).transpose()?;

        let mut manager = CoefficientManager::new(
            config.coefficients.mode,
            seconds(config.coefficients.refresh_interval_sec),
            default,
            manual,
            None,
        )
        .await?;
        let mut pipeline = SamplePipeline::new(manager.current().clone(), log)?;

        let accepts_commands = self.opener.accepts_commands();
        let (frame_tx, mut frame_rx) = mpsc::channel(config.host.queue_maxsize);
        let (transport, handle) =
            SerialTransport::new(config.transport_config(), self.opener, frame_tx);
        let transport_task = tokio::spawn(transport.run());
        let abort_transport = transport_task.abort_handle();

        info!(
            port = %config.serial.port,
            format = %config.frame_format,
            coeff_mode = %manager.mode(),
            queue = config.host.queue_maxsize,
            "Host started"
        );

        if manager.mode() == CoefficientMode::Auto && accepts_commands {
            if !handle.wait_ready(seconds(config.host.ready_timeout_sec)).await {
                warn!(
                    timeout_sec = config.host.ready_timeout_sec,
                    "Transport not ready yet; device coefficients will be polled once connected"
                );
            }
            manager.attach_device(Box::new(EepromOverCommand::new(
                handle.clone(),
                seconds(config.coefficients.command_timeout_sec),
            )));
        }

        let mut allan = AllanWindow::new(config.allan_window);
        let stats_interval = seconds(config.host.stats_log_interval);
        let mut next_stats = Instant::now() + stats_interval;
        let mut outcome = Ok(());

        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                _ = &mut shutdown => LoopEvent::Shutdown,
                received = tokio::time::timeout(QUEUE_POLL_INTERVAL, frame_rx.recv()) => {
                    match received {
                        Ok(Some(frame)) => LoopEvent::Frame(frame),
                        Ok(None) => LoopEvent::SourceEnded,
                        Err(_) => LoopEvent::Idle,
                    }
                }
            };

            match event {
                LoopEvent::Frame(frame) => {
                    match pipeline.process(&frame) {
                        Ok(_) => {}
                        Err(err) if err.is_transient() => {
                            warn!(error = %err, "Sample skipped");
                        }
                        Err(err) => {
                            outcome = Err(err);
                            break;
                        }
                    }
                    allan.push(frame.f_hz);
                    if let Some(set) = manager.refresh(Instant::now()).await {
                        if let Err(err) = pipeline.update_coefficients(set) {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                LoopEvent::Idle => {}
                LoopEvent::SourceEnded => {
                    info!("Frame source ended");
                    break;
                }
                LoopEvent::Shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_stats {
                log_stats(&handle, &manager, &pipeline, &allan, config.tau_ms);
                next_stats = now + stats_interval;
            }
        }

        handle.shutdown();
        let join_timeout = seconds(config.host.join_timeout_sec);
        let transport_stats = match tokio::time::timeout(join_timeout, transport_task).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(err)) => {
                warn!(error = %err, "Transport task failed");
                handle.stats()
            }
            Err(_) => {
                warn!(
                    timeout_sec = config.host.join_timeout_sec,
                    "Transport did not stop in time; aborting"
                );
                abort_transport.abort();
                handle.stats()
            }
        };

        let closed = pipeline.close();
        let summary = RunSummary {
            samples: pipeline.samples(),
            transport: transport_stats,
            coefficients: manager.stats(),
            elapsed: started.elapsed(),
        };
        info!(
            samples = summary.samples,
            frames = summary.transport.frames,
            crc_errors = summary.transport.crc_errors,
            length_errors = summary.transport.length_errors,
            decode_errors = summary.transport.decode_errors,
            dropped = summary.transport.dropped,
            reconnects = summary.transport.reconnects,
            coeff_updates = summary.coefficients.updates,
            "Host stopped"
        );

        outcome?;
        closed?;
        Ok(summary)
    }
}

fn log_stats(
    handle: &TransportHandle,
    manager: &CoefficientManager,
    pipeline: &SamplePipeline,
    allan: &AllanWindow,
    tau_ms: f64,
) {
    let stats = handle.stats();
    info!(
        samples = pipeline.samples(),
        frames = stats.frames,
        crc_errors = stats.crc_errors,
        length_errors = stats.length_errors,
        decode_errors = stats.decode_errors,
        dropped = stats.dropped,
        reconnects = stats.reconnects,
        connected = handle.is_ready(),
        coeff_source = %manager.current().provenance(),
        "Host stats"
    );
    if allan.is_enabled() {
        match allan.deviation(tau_ms / 1000.0) {
            Some(adev) => info!(samples = allan.len(), adev_hz = adev, "Allan deviation"),
            None => debug!(samples = allan.len(), "Not enough samples for Allan deviation"),
        }
    }
}
