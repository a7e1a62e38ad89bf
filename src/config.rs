//! Host configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults
//! 2. TOML file (`--config`)
//! 3. Environment variables prefixed with `TERPS_`, nested with `__`
//!    (e.g. `TERPS_HOST__QUEUE_MAXSIZE=1024`)
//! 4. Preset overrides (`--preset 0p02`)
//! 5. Command-line overrides (`--set adc.gain=32`)
//!
//! # Example
//! ```no_run
//! use terps_host::config::TerpsConfig;
//!
//! let config = TerpsConfig::load(None, None, &["adc.gain=32".to_string()])?;
//! config.validate()?;
//! # Ok::<(), terps_host::error::TerpsError>(())
//! ```

use crate::coeff::{CoefficientMode, StaticDefault};
use crate::error::{AppResult, TerpsError};
use crate::hardware::TransportConfig;
use crate::presets;
use crate::protocol::{FrameFormat, OperatingMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerpsConfig {
    /// Counting mode requested from the device
    pub mode: OperatingMode,
    /// Gate / reciprocal time constant (ms)
    pub tau_ms: f64,
    /// Minimum interval as a fraction of `tau_ms`
    pub min_interval_frac: f64,
    /// Timebase correction applied on the device (ppm)
    pub timebase_ppm: f64,
    /// Telemetry wire format (`csv` or `binary`)
    pub frame_format: FrameFormat,
    /// Sample log destination; no log when absent
    pub output_csv: Option<PathBuf>,
    /// Sample count for Allan deviation (0 = off)
    pub allan_window: usize,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Device ADC settings
    pub adc: AdcConfig,
    /// Static calibration polynomial
    pub sensor_poly: SensorPolyConfig,
    /// Host runtime tuning
    pub host: HostConfig,
    /// Serial link
    pub serial: SerialConfig,
    /// Coefficient arbitration
    pub coefficients: CoefficientConfig,
}

/// Device ADC settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    /// PGA gain
    pub gain: u8,
    /// Output data rate (samples per second)
    pub rate_sps: u32,
    /// 50/60 Hz rejection filter
    pub mains_reject: bool,
}

/// Static calibration polynomial `K[i][j]` around `(X, Y)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPolyConfig {
    /// Frequency reference point
    #[serde(rename = "X", alias = "x")]
    pub x: f64,
    /// Voltage reference point
    #[serde(rename = "Y", alias = "y")]
    pub y: f64,
    /// Coefficient matrix, rows indexed by frequency power
    #[serde(rename = "K", alias = "k")]
    pub k: Vec<Vec<f64>>,
}

/// Host runtime tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bounded frame queue capacity
    pub queue_maxsize: usize,
    /// First reconnect delay (seconds)
    pub reconnect_initial_sec: f64,
    /// Reconnect delay ceiling (seconds)
    pub reconnect_max_sec: f64,
    /// Interval between stats log lines (seconds)
    pub stats_log_interval: f64,
    /// Read size in binary mode
    pub binary_chunk_size: usize,
    /// How long to wait for the link before attaching the device provider
    pub ready_timeout_sec: f64,
    /// Bound on joining the transport task at shutdown
    pub join_timeout_sec: f64,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, or `-` for standard input
    pub port: String,
    /// Baud rate for UART links
    pub baud_rate: u32,
    /// Read timeout (seconds)
    pub timeout_sec: f64,
}

/// Coefficient arbitration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoefficientConfig {
    /// Arbitration policy
    pub mode: CoefficientMode,
    /// Manual override JSON file
    pub manual_path: Option<PathBuf>,
    /// Device polling interval (seconds, clamped to at least 1)
    pub refresh_interval_sec: f64,
    /// Timeout for the EEPROM dump command (seconds)
    pub command_timeout_sec: f64,
    /// Unit label of the static default
    pub unit: String,
}

impl Default for TerpsConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Recip,
            tau_ms: 100.0,
            min_interval_frac: 0.25,
            timebase_ppm: 0.0,
            frame_format: FrameFormat::Csv,
            output_csv: None,
            allan_window: 0,
            log_level: "info".to_string(),
            adc: AdcConfig::default(),
            sensor_poly: SensorPolyConfig::default(),
            host: HostConfig::default(),
            serial: SerialConfig::default(),
            coefficients: CoefficientConfig::default(),
        }
    }
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            gain: 16,
            rate_sps: 20,
            mains_reject: true,
        }
    }
}

impl Default for SensorPolyConfig {
    fn default() -> Self {
        Self {
            x: 30_000.0,
            y: 600_000.0,
            k: vec![vec![0.0; 5]; 6],
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: 512,
            reconnect_initial_sec: 0.5,
            reconnect_max_sec: 5.0,
            stats_log_interval: 60.0,
            binary_chunk_size: 256,
            ready_timeout_sec: 5.0,
            join_timeout_sec: 2.0,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 921_600,
            timeout_sec: 2.0,
        }
    }
}

impl Default for CoefficientConfig {
    fn default() -> Self {
        Self {
            mode: CoefficientMode::Auto,
            manual_path: None,
            refresh_interval_sec: 60.0,
            command_timeout_sec: 2.0,
            unit: crate::coeff::set::DEFAULT_UNIT.to_string(),
        }
    }
}

impl TerpsConfig {
    /// Build the layered figment without extracting it.
    pub fn figment(
        path: Option<&Path>,
        preset: Option<&str>,
        overrides: &[String],
    ) -> AppResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(TerpsConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(TerpsError::Configuration(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("TERPS_").split("__"));

        if let Some(name) = preset {
            let preset = presets::find(name).ok_or_else(|| {
                TerpsError::Configuration(format!(
                    "unknown preset '{}' (available: {})",
                    name,
                    presets::names().join(", ")
                ))
            })?;
            for item in preset.overrides() {
                let (key, value) = parse_override(&item)?;
                figment = figment.merge(Serialized::default(&key, value));
            }
        }

        for item in overrides {
            let (key, value) = parse_override(item)?;
            figment = figment.merge(Serialized::default(&key, value));
        }
        Ok(figment)
    }

    /// Load the layered configuration.
    pub fn load(path: Option<&Path>, preset: Option<&str>, overrides: &[String]) -> AppResult<Self> {
        Ok(Self::figment(path, preset, overrides)?.extract()?)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(TerpsError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if let OperatingMode::Unknown(code) = self.mode {
            return Err(TerpsError::Configuration(format!(
                "mode must be GATED or RECIP, got code {}",
                code
            )));
        }

        self.static_default()
            .map_err(|e| TerpsError::Configuration(format!("sensor_poly.K: {}", e)))?;

        let host = &self.host;
        if host.queue_maxsize == 0 {
            return Err(TerpsError::Configuration(
                "host.queue_maxsize must be greater than 0".into(),
            ));
        }
        if host.binary_chunk_size == 0 {
            return Err(TerpsError::Configuration(
                "host.binary_chunk_size must be greater than 0".into(),
            ));
        }
        if !(host.reconnect_initial_sec > 0.0 && host.reconnect_max_sec > 0.0) {
            return Err(TerpsError::Configuration(
                "host reconnect timings must be positive".into(),
            ));
        }
        if host.reconnect_initial_sec > host.reconnect_max_sec {
            return Err(TerpsError::Configuration(format!(
                "host.reconnect_initial_sec ({}) exceeds host.reconnect_max_sec ({})",
                host.reconnect_initial_sec, host.reconnect_max_sec
            )));
        }
        for (name, value) in [
            ("host.stats_log_interval", host.stats_log_interval),
            ("host.ready_timeout_sec", host.ready_timeout_sec),
            ("host.join_timeout_sec", host.join_timeout_sec),
            ("serial.timeout_sec", self.serial.timeout_sec),
            (
                "coefficients.command_timeout_sec",
                self.coefficients.command_timeout_sec,
            ),
            (
                "coefficients.refresh_interval_sec",
                self.coefficients.refresh_interval_sec,
            ),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(TerpsError::Configuration(format!(
                    "{} must be a positive number of seconds, got {}",
                    name, value
                )));
            }
        }

        if self.coefficients.mode == CoefficientMode::Manual
            && self.coefficients.manual_path.is_none()
        {
            return Err(TerpsError::Configuration(
                "coefficients.mode = manual requires coefficients.manual_path".into(),
            ));
        }

        Ok(())
    }

    /// The static coefficient provider described by `sensor_poly`.
    pub fn static_default(&self) -> Result<StaticDefault, crate::coeff::CoefficientError> {
        StaticDefault::from_sensor_poly(&self.sensor_poly, &self.coefficients.unit)
    }

    /// Transport tuning derived from the `host` and `serial` sections.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            frame_format: self.frame_format,
            read_timeout: seconds(self.serial.timeout_sec),
            reconnect_initial: seconds(self.host.reconnect_initial_sec),
            reconnect_max: seconds(self.host.reconnect_max_sec),
            chunk_size: self.host.binary_chunk_size,
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TerpsError::Configuration(format!("cannot render config: {}", e)))
    }
}

/// Convert a positive seconds value into a `Duration`, saturating bad input to zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Split a `key=value` override and coerce the value.
pub fn parse_override(item: &str) -> AppResult<(String, Value)> {
    let (key, raw) = item.split_once('=').ok_or_else(|| {
        TerpsError::Configuration(format!("Override '{}' must use key=value syntax", item))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(TerpsError::Configuration(
            "Override key may not be empty".into(),
        ));
    }
    Ok((key.to_string(), coerce_value(raw.trim())?))
}

/// Interpret an override value as bool, number, JSON array/object, or string.
pub fn coerce_value(raw: &str) -> AppResult<Value> {
    let lowered = raw.to_ascii_lowercase();
    if lowered == "true" || lowered == "false" {
        return Ok(Value::Bool(lowered == "true"));
    }
    if raw.contains('.') || lowered.contains('e') {
        if let Ok(number) = raw.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(number) {
                return Ok(Value::Number(number));
            }
        }
    } else if let Ok(number) = raw.parse::<i64>() {
        return Ok(Value::from(number));
    }
    if (raw.starts_with('[') && raw.ends_with(']')) || (raw.starts_with('{') && raw.ends_with('}'))
    {
        return Ok(serde_json::from_str(raw)?);
    }
    Ok(Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = TerpsConfig::load(None, None, &[]).unwrap();
        assert_eq!(config, TerpsConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.host.queue_maxsize, 512);
        assert_eq!(config.serial.baud_rate, 921_600);
        assert_eq!(config.sensor_poly.k.len(), 6);
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(coerce_value("true").unwrap(), Value::Bool(true));
        assert_eq!(coerce_value("FALSE").unwrap(), Value::Bool(false));
        assert_eq!(coerce_value("32").unwrap(), Value::from(32));
        assert_eq!(coerce_value("30500.5").unwrap(), Value::from(30500.5));
        assert_eq!(coerce_value("1e3").unwrap(), Value::from(1000.0));
        assert_eq!(
            coerce_value("[[1, 2], [3, 4]]").unwrap(),
            serde_json::json!([[1, 2], [3, 4]])
        );
        assert_eq!(coerce_value("binary").unwrap(), Value::from("binary"));
        assert_eq!(coerce_value("GATED").unwrap(), Value::from("GATED"));
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("=5").is_err());
    }

    #[test]
    fn file_then_overrides() {
        let file = write_toml(
            r#"
            frame_format = "binary"
            tau_ms = 250.0

            [adc]
            gain = 8

            [sensor_poly]
            X = 1.0
            Y = 2.0
            K = [[0.0, 1.0], [2.0, 3.0]]
            "#,
        );
        let config = TerpsConfig::load(
            Some(file.path()),
            None,
            &[
                "adc.gain=32".to_string(),
                "sensor_poly.X=30500".to_string(),
                "output_csv=/tmp/terps.csv".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(config.frame_format, FrameFormat::Binary);
        assert_eq!(config.tau_ms, 250.0);
        assert_eq!(config.adc.gain, 32);
        assert!(config.adc.mains_reject);
        assert_eq!(config.sensor_poly.x, 30500.0);
        assert_eq!(config.sensor_poly.k, vec![vec![0.0, 1.0], vec![2.0, 3.0]]);
        assert_eq!(config.output_csv, Some(PathBuf::from("/tmp/terps.csv")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn preset_applies_and_set_wins() {
        let config = TerpsConfig::load(None, Some("0p02"), &["adc.gain=4".to_string()]).unwrap();
        assert_eq!(config.mode, OperatingMode::Recip);
        assert_eq!(config.tau_ms, 100.0);
        assert_eq!(config.adc.rate_sps, 50);
        assert_eq!(config.adc.gain, 4);

        let err = TerpsConfig::load(None, Some("9p99"), &[]).unwrap_err();
        assert!(err.to_string().contains("unknown preset"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err =
            TerpsConfig::load(Some(Path::new("/nonexistent/terps.toml")), None, &[]).unwrap_err();
        assert!(matches!(err, TerpsError::Configuration(_)));
    }

    #[test]
    fn validation_failures() {
        let mut config = TerpsConfig::default();
        config.sensor_poly.k = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(config.validate().is_err());

        let mut config = TerpsConfig::default();
        config.sensor_poly.k = vec![];
        assert!(config.validate().is_err());

        let mut config = TerpsConfig::default();
        config.host.queue_maxsize = 0;
        assert!(config.validate().is_err());

        let mut config = TerpsConfig::default();
        config.host.reconnect_initial_sec = 10.0;
        assert!(config.validate().is_err());

        let mut config = TerpsConfig::default();
        config.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = TerpsConfig::default();
        config.coefficients.mode = CoefficientMode::Manual;
        assert!(config.validate().is_err());
        config.coefficients.manual_path = Some(PathBuf::from("manual.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn transport_config_uses_seconds() {
        let mut config = TerpsConfig::default();
        config.serial.timeout_sec = 0.25;
        config.frame_format = FrameFormat::Binary;
        let transport = config.transport_config();
        assert_eq!(transport.read_timeout, Duration::from_millis(250));
        assert_eq!(transport.reconnect_initial, Duration::from_millis(500));
        assert_eq!(transport.reconnect_max, Duration::from_secs(5));
        assert_eq!(transport.frame_format, FrameFormat::Binary);
    }

    #[test]
    fn renders_as_toml() {
        let text = TerpsConfig::default().to_toml().unwrap();
        assert!(text.contains("queue_maxsize = 512"));
        assert!(text.contains("frame_format = \"csv\""));
    }
}
