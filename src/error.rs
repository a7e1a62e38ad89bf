//! Custom error types for the application.
//!
//! This module defines the primary error type, `TerpsError`, for the whole host agent.
//! Using the `thiserror` crate, it provides a centralized way to handle the different
//! kinds of failures that can occur, from configuration problems to device-side
//! command failures.
//!
//! ## Error Hierarchy
//!
//! `TerpsError` consolidates the per-concern error enums:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   while layering the configuration sources.
//! - **`Configuration`**: Semantic configuration errors that pass parsing but are
//!   logically wrong (ragged coefficient matrix, zero queue size, manual mode without a
//!   manual file). Fatal at startup, reported before any I/O begins.
//! - **`Io`**: Wraps `std::io::Error` (sample log, manual coefficient files).
//! - **`Decode`**: A telemetry record could not be decoded. Fatal to that record only.
//! - **`Eeprom`**: An EEPROM image or dump reply was rejected. Fatal to that fetch only.
//! - **`Coefficient`**: A coefficient set violates its dimensional invariant.
//! - **`Command`**: A device command failed (timeout, write failure, not connected,
//!   disconnected). The coefficient manager treats these as "no update this cycle".
//!
//! By using `#[from]`, `TerpsError` can be created from the underlying error types,
//! so the `?` operator works across module boundaries.

use crate::coeff::CoefficientError;
use crate::hardware::CommandError;
use crate::protocol::{DecodeError, EepromError};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, TerpsError>;

/// Primary error type for the host agent.
#[derive(Error, Debug)]
pub enum TerpsError {
    /// Layered configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying filesystem or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (manual coefficient file) could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A telemetry record was malformed.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An EEPROM image or dump reply was rejected.
    #[error("EEPROM error: {0}")]
    Eeprom(#[from] EepromError),

    /// A coefficient set is structurally invalid.
    #[error("Coefficient error: {0}")]
    Coefficient(#[from] CoefficientError),

    /// A device command failed.
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Sample storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for TerpsError {
    fn from(value: figment::Error) -> Self {
        TerpsError::Config(Box::new(value))
    }
}

impl TerpsError {
    /// Whether the error only affects the current unit of work.
    ///
    /// Configuration and storage errors stop the process; everything else is logged
    /// and retried by the surrounding loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TerpsError::Decode(_) | TerpsError::Eeprom(_) | TerpsError::Command(_)
        )
    }
}
