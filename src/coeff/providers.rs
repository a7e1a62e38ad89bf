//! Coefficient providers.
//!
//! Three sources compete for the active calibration: an operator override file,
//! the device's calibration EEPROM (read over the command channel), and the static
//! `sensor_poly` from configuration.

use super::{CoefficientError, CoefficientSet, Provenance};
use crate::config::SensorPolyConfig;
use crate::error::AppResult;
use crate::hardware::CommandError;
use crate::protocol::{decode_eeprom, parse_dump_reply, EEPROM_DUMP_COMMAND};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Issues a command on the device link and returns its reply lines.
///
/// Implemented by the serial transport handle; tests use scripted executors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command`, waiting at most `timeout` for the full reply.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<Vec<String>, CommandError>;
}

/// A coefficient source backed by a live device.
#[async_trait]
pub trait DeviceCoefficientSource: Send {
    /// Read the current coefficients from the device.
    async fn fetch(&mut self) -> AppResult<CoefficientSet>;

    /// Human-readable name used in logs.
    fn describe(&self) -> String {
        "device".to_string()
    }
}

/// Operator-supplied coefficient override.
#[derive(Debug, Clone, Default)]
pub struct ManualOverride {
    set: Option<CoefficientSet>,
}

impl ManualOverride {
    /// An override holding `set`, or nothing.
    pub fn new(set: Option<CoefficientSet>) -> Self {
        Self { set }
    }

    /// Load an override from its JSON file.
    pub fn load(path: &Path) -> AppResult<Self> {
        Ok(Self::new(Some(CoefficientSet::load_manual(path)?)))
    }

    /// The override, if one is present.
    pub fn get(&self) -> Option<&CoefficientSet> {
        self.set.as_ref()
    }

    /// Replace or clear the override.
    pub fn replace(&mut self, set: Option<CoefficientSet>) {
        self.set = set;
    }
}

/// Coefficients from the static `sensor_poly` configuration.
#[derive(Debug, Clone)]
pub struct StaticDefault {
    set: CoefficientSet,
}

impl StaticDefault {
    /// Wrap an existing set.
    pub fn new(set: CoefficientSet) -> Self {
        Self { set }
    }

    /// Build from the `sensor_poly` configuration section.
    pub fn from_sensor_poly(poly: &SensorPolyConfig, unit: &str) -> Result<Self, CoefficientError> {
        let set = CoefficientSet::from_matrix(Provenance::Config, poly.x, poly.y, &poly.k, unit)?;
        Ok(Self::new(set))
    }

    /// The static set.
    pub fn get(&self) -> &CoefficientSet {
        &self.set
    }
}

/// Reads the calibration EEPROM through `EEPROM.DUMP`.
///
/// The last raw image is cached: a byte-identical dump returns the previous set
/// without decoding it again.
pub struct EepromOverCommand<E> {
    executor: E,
    timeout: Duration,
    last_blob: Option<Vec<u8>>,
    last_set: Option<CoefficientSet>,
}

impl<E: CommandExecutor> EepromOverCommand<E> {
    /// Create a provider issuing commands through `executor`.
    pub fn new(executor: E, timeout: Duration) -> Self {
        Self {
            executor,
            timeout,
            last_blob: None,
            last_set: None,
        }
    }
}

#[async_trait]
impl<E: CommandExecutor> DeviceCoefficientSource for EepromOverCommand<E> {
    async fn fetch(&mut self) -> AppResult<CoefficientSet> {
        let lines = self
            .executor
            .execute(EEPROM_DUMP_COMMAND, self.timeout)
            .await?;
        let reply = parse_dump_reply(&lines)?;

        if let (Some(blob), Some(set)) = (&self.last_blob, &self.last_set) {
            if *blob == reply.data {
                debug!("EEPROM image unchanged, reusing decoded coefficients");
                return Ok(set.clone());
            }
        }

        let set = decode_eeprom(&reply.data, Provenance::Eeprom, reply.device_address())?;
        self.last_blob = Some(reply.data);
        self.last_set = Some(set.clone());
        Ok(set)
    }

    fn describe(&self) -> String {
        "eeprom".to_string()
    }
}
