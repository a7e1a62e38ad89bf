//! # TERPS Host Library
//!
//! Host-side acquisition agent for TERPS resonant pressure sensors. The device
//! streams frequency/voltage telemetry over a serial link; the host reassembles
//! frames, evaluates the calibration surface and logs pressure samples, while
//! keeping the calibration coefficients in sync with the sensor's EEPROM through
//! commands multiplexed on the same link.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Wire formats. Binary and text telemetry frames, CRC-16, the
//!   stream reassembler and the calibration EEPROM image.
//! - **`hardware`**: Serial port openers and the `SerialTransport` task that owns
//!   the link, reconnects and multiplexes device commands with telemetry.
//! - **`coeff`**: Coefficient sets, their providers (manual file, configuration,
//!   on-device EEPROM) and the `CoefficientManager` arbitrating between them.
//! - **`data`**: The `SamplePipeline` turning frames into pressure samples, the CSV
//!   sample log and the Allan deviation tracker.
//! - **`host`**: The `HostOrchestrator` running one acquisition session.
//! - **`config`**: Layered configuration (defaults, TOML, environment, presets,
//!   command-line overrides) built with `figment`.
//! - **`presets`**: Named acquisition presets.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The crate error type `TerpsError`.

pub mod coeff;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod host;
pub mod logging;
pub mod presets;
pub mod protocol;
