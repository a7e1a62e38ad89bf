//! Coefficient source arbitration.
//!
//! [`CoefficientManager`] owns the notion of "which calibration is active". The
//! policy is selected by [`CoefficientMode`]:
//!
//! - `manual`: the override file is mandatory and always wins.
//! - `config`: the static `sensor_poly` is always used.
//! - `auto`: manual override if present, else the device EEPROM polled at
//!   `refresh_interval`, else the static default.
//!
//! `refresh` is a cheap tick called after every processed frame; it only talks to
//! the device when a poll is due.

use super::providers::{DeviceCoefficientSource, ManualOverride, StaticDefault};
use super::CoefficientSet;
use crate::error::{AppResult, TerpsError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lower bound on the device polling interval.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Arbitration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CoefficientMode {
    /// Manual override only
    Manual,
    /// Static configuration only
    Config,
    /// Manual, then device, then configuration
    #[default]
    Auto,
}

impl fmt::Display for CoefficientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoefficientMode::Manual => "manual",
            CoefficientMode::Config => "config",
            CoefficientMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for CoefficientMode {
    type Err = TerpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(CoefficientMode::Manual),
            "config" => Ok(CoefficientMode::Config),
            "auto" => Ok(CoefficientMode::Auto),
            other => Err(TerpsError::Configuration(format!(
                "unknown coefficient mode '{}' (expected manual, config or auto)",
                other
            ))),
        }
    }
}

/// Counters exposed for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Device fetches attempted
    pub fetches: u64,
    /// Device fetches that failed
    pub fetch_failures: u64,
    /// Times the active set was replaced
    pub updates: u64,
}

/// Selects and refreshes the active coefficient set.
pub struct CoefficientManager {
    mode: CoefficientMode,
    refresh_interval: Duration,
    default: StaticDefault,
    manual: ManualOverride,
    device: Option<Box<dyn DeviceCoefficientSource>>,
    last_refresh: Option<Instant>,
    current: CoefficientSet,
    stats: ManagerStats,
}

impl CoefficientManager {
    /// Build a manager and select the initial set.
    ///
    /// In `auto` mode without a manual override, a device provider (if given) is
    /// fetched once; a failure there is logged and the static default is used.
    pub async fn new(
        mode: CoefficientMode,
        refresh_interval: Duration,
        default: StaticDefault,
        manual: ManualOverride,
        device: Option<Box<dyn DeviceCoefficientSource>>,
    ) -> AppResult<Self> {
        if mode == CoefficientMode::Manual && manual.get().is_none() {
            return Err(TerpsError::Configuration(
                "coefficient mode 'manual' requires a manual coefficient file".into(),
            ));
        }

        let initial = default.get().clone();
        let mut manager = Self {
            mode,
            refresh_interval: refresh_interval.max(MIN_REFRESH_INTERVAL),
            default,
            manual,
            device,
            last_refresh: None,
            current: initial,
            stats: ManagerStats::default(),
        };
        manager.current = manager.select_initial().await;
        Ok(manager)
    }

    async fn select_initial(&mut self) -> CoefficientSet {
        if let Some(manual) = self.manual.get() {
            if self.mode != CoefficientMode::Config {
                info!(
                    serial = manual.serial().unwrap_or("n/a"),
                    "Using manual coefficients"
                );
                return manual.clone();
            }
        }
        if self.mode == CoefficientMode::Auto && self.device.is_some() {
            self.last_refresh = Some(Instant::now());
            if let Some(set) = self.try_fetch(true).await {
                info!(
                    serial = set.serial().unwrap_or("n/a"),
                    "Using device coefficients"
                );
                return set;
            }
        }
        info!("Using config coefficients");
        self.default.get().clone()
    }

    /// The active set.
    pub fn current(&self) -> &CoefficientSet {
        &self.current
    }

    /// Active policy.
    pub fn mode(&self) -> CoefficientMode {
        self.mode
    }

    /// Effective polling interval after clamping.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Counters.
    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Whether a device provider is attached.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Attach a device provider after construction. The next `auto` refresh polls
    /// it immediately.
    pub fn attach_device(&mut self, device: Box<dyn DeviceCoefficientSource>) {
        debug!(provider = %device.describe(), "Attached device coefficient provider");
        self.device = Some(device);
        self.last_refresh = None;
    }

    /// Replace or clear the manual override.
    pub fn set_manual_override(&mut self, set: Option<CoefficientSet>) {
        self.manual.replace(set);
    }

    /// Re-evaluate the active source. Returns the new set when it changed.
    pub async fn refresh(&mut self, now: Instant) -> Option<CoefficientSet> {
        match self.mode {
            CoefficientMode::Manual => {
                let manual = self.manual.get()?;
                if manual.is_equivalent(&self.current) {
                    return None;
                }
                let manual = manual.clone();
                info!(
                    serial = manual.serial().unwrap_or("n/a"),
                    "Manual coefficients updated"
                );
                self.swap(manual)
            }
            CoefficientMode::Config => {
                let target = self.default.get();
                if target.is_equivalent(&self.current) {
                    return None;
                }
                let target = target.clone();
                info!("Reverting to config coefficients");
                self.swap(target)
            }
            CoefficientMode::Auto => self.refresh_auto(now).await,
        }
    }

    async fn refresh_auto(&mut self, now: Instant) -> Option<CoefficientSet> {
        if let Some(manual) = self.manual.get() {
            if manual.is_equivalent(&self.current) {
                return None;
            }
            let manual = manual.clone();
            info!(
                serial = manual.serial().unwrap_or("n/a"),
                "Switching to manual coefficients"
            );
            return self.swap(manual);
        }

        if self.device.is_none() {
            let target = self.default.get();
            if target.is_equivalent(&self.current) {
                return None;
            }
            let target = target.clone();
            info!("Falling back to config coefficients (no device provider)");
            return self.swap(target);
        }

        if let Some(last) = self.last_refresh {
            if now.saturating_duration_since(last) < self.refresh_interval {
                return None;
            }
        }
        self.last_refresh = Some(now);

        let set = self.try_fetch(false).await?;
        if set.is_equivalent(&self.current) {
            return None;
        }
        info!(
            serial = set.serial().unwrap_or("n/a"),
            device = %format!("{:#04X}", set.device_address().unwrap_or(0)),
            "Loaded device coefficients"
        );
        self.swap(set)
    }

    async fn try_fetch(&mut self, initial: bool) -> Option<CoefficientSet> {
        let device = self.device.as_mut()?;
        self.stats.fetches += 1;
        match device.fetch().await {
            Ok(set) => Some(set),
            Err(err) => {
                self.stats.fetch_failures += 1;
                if initial {
                    debug!(error = %err, "Initial device coefficient fetch failed");
                } else if err.is_transient() {
                    warn!(error = %err, "Failed to load device coefficients");
                } else {
                    error!(error = %err, "Device coefficient provider failed");
                }
                None
            }
        }
    }

    fn swap(&mut self, set: CoefficientSet) -> Option<CoefficientSet> {
        self.stats.updates += 1;
        self.current = set.clone();
        Some(set)
    }
}
