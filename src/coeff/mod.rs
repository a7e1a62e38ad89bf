//! Calibration coefficients: the set type, its providers, and the manager that
//! arbitrates between them.

pub mod manager;
pub mod providers;
pub mod set;

pub use manager::{CoefficientManager, CoefficientMode};
pub use providers::{
    CommandExecutor, DeviceCoefficientSource, EepromOverCommand, ManualOverride, StaticDefault,
};
pub use set::{coefficient_metadata, CoefficientSet, ManualCoefficientFile, Provenance};

use thiserror::Error;

/// Structural problems with a coefficient set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoefficientError {
    /// Flattened vector length does not match `(nx+1)*(ny+1)`.
    #[error("coefficient vector has {actual} entries, expected {expected} for nx={nx}, ny={ny}")]
    Dimension {
        /// Highest frequency power
        nx: usize,
        /// Highest voltage power
        ny: usize,
        /// Required vector length
        expected: usize,
        /// Supplied vector length
        actual: usize,
    },

    /// Matrix has no rows or no columns.
    #[error("coefficient matrix must be a non-empty 2-D matrix")]
    EmptyMatrix,

    /// Matrix rows differ in length.
    #[error("coefficient matrix row {row} has {actual} entries, expected {expected}")]
    RaggedMatrix {
        /// Offending row index
        row: usize,
        /// Length of the first row
        expected: usize,
        /// Length of the offending row
        actual: usize,
    },
}
