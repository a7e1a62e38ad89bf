//! Calibration coefficient sets and the manual override file format.

use super::CoefficientError;
use crate::error::{AppResult, TerpsError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Default physical unit of the polynomial output.
pub const DEFAULT_UNIT: &str = "Pa";

/// Where a coefficient set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Operator-supplied override file
    Manual,
    /// Read from the sensor's calibration EEPROM
    Eeprom,
    /// Static `sensor_poly` from configuration
    Config,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provenance::Manual => "manual",
            Provenance::Eeprom => "eeprom",
            Provenance::Config => "config",
        };
        f.write_str(name)
    }
}

/// 2-D calibration polynomial description.
///
/// `coefficients` holds the `(nx+1) x (ny+1)` matrix flattened row-major; the
/// constructors guarantee the length matches. Sets are never mutated after
/// construction apart from the builder-style `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientSet {
    order: usize,
    unit: String,
    coefficients: Vec<f64>,
    serial: Option<String>,
    provenance: Provenance,
    x_ref: f64,
    y_ref: f64,
    nx: usize,
    ny: usize,
    product: Option<String>,
    device_address: Option<u16>,
}

impl CoefficientSet {
    /// Build a set from a flattened row-major vector.
    pub fn new(
        provenance: Provenance,
        nx: usize,
        ny: usize,
        coefficients: Vec<f64>,
        x_ref: f64,
        y_ref: f64,
        unit: impl Into<String>,
    ) -> Result<Self, CoefficientError> {
        let expected = nx
            .checked_add(1)
            .zip(ny.checked_add(1))
            .and_then(|(rows, cols)| rows.checked_mul(cols));
        if expected != Some(coefficients.len()) {
            return Err(CoefficientError::Dimension {
                nx,
                ny,
                // saturated when the shape itself is unrepresentable
                expected: expected.unwrap_or(usize::MAX),
                actual: coefficients.len(),
            });
        }
        Ok(Self {
            order: nx.max(ny),
            unit: unit.into(),
            coefficients,
            serial: None,
            provenance,
            x_ref,
            y_ref,
            nx,
            ny,
            product: None,
            device_address: None,
        })
    }

    /// Build a set from a rectangular matrix `K[i][j]`.
    pub fn from_matrix(
        provenance: Provenance,
        x_ref: f64,
        y_ref: f64,
        matrix: &[Vec<f64>],
        unit: impl Into<String>,
    ) -> Result<Self, CoefficientError> {
        let first = matrix.first().ok_or(CoefficientError::EmptyMatrix)?;
        let cols = first.len();
        if cols == 0 {
            return Err(CoefficientError::EmptyMatrix);
        }
        for (row, values) in matrix.iter().enumerate() {
            if values.len() != cols {
                return Err(CoefficientError::RaggedMatrix {
                    row,
                    expected: cols,
                    actual: values.len(),
                });
            }
        }
        let flattened = matrix.iter().flatten().copied().collect();
        Self::new(
            provenance,
            matrix.len() - 1,
            cols - 1,
            flattened,
            x_ref,
            y_ref,
            unit,
        )
    }

    /// Attach or clear the sensor serial.
    #[must_use]
    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = serial;
        self
    }

    /// Attach or clear the product string.
    #[must_use]
    pub fn with_product(mut self, product: Option<String>) -> Self {
        self.product = product;
        self
    }

    /// Attach the bus address of the device the set was read from.
    #[must_use]
    pub fn with_device_address(mut self, address: u16) -> Self {
        self.device_address = Some(address);
        self
    }

    /// Override the reported order.
    #[must_use]
    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Reported polynomial order (`max(nx, ny)` unless overridden).
    pub fn order(&self) -> usize {
        self.order
    }

    /// Unit label of the evaluated surface.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Flattened row-major coefficient vector.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Sensor serial, if known.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Source of the set.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Frequency reference point.
    pub fn x_ref(&self) -> f64 {
        self.x_ref
    }

    /// Voltage reference point.
    pub fn y_ref(&self) -> f64 {
        self.y_ref
    }

    /// Highest power of the frequency term.
    pub fn nx(&self) -> usize {
        self.nx
    }

    /// Highest power of the voltage term.
    pub fn ny(&self) -> usize {
        self.ny
    }

    /// Product string, if known.
    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    /// Device bus address, if the set came from a device.
    pub fn device_address(&self) -> Option<u16> {
        self.device_address
    }

    /// Rows of the coefficient matrix, `K[i]` for `i` in `0..=nx`.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.coefficients.chunks(self.ny + 1)
    }

    /// Whether replacing `self` with `other` would be a no-op.
    ///
    /// Two sets from the same source that both carry a serial are compared by serial
    /// alone; otherwise coefficients and reference points must match bit for bit.
    pub fn is_equivalent(&self, other: &CoefficientSet) -> bool {
        if self.provenance == other.provenance {
            if let (Some(lhs), Some(rhs)) = (self.serial(), other.serial()) {
                return lhs == rhs;
            }
        }
        self.coefficients.len() == other.coefficients.len()
            && self
                .coefficients
                .iter()
                .zip(&other.coefficients)
                .all(|(a, b)| a.to_bits() == b.to_bits())
            && self.x_ref.to_bits() == other.x_ref.to_bits()
            && self.y_ref.to_bits() == other.y_ref.to_bits()
    }

    /// Ordered `key=value` tags describing the set, for log headers.
    pub fn metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            ("coeff_source", self.provenance.to_string()),
            ("coeff_order", self.order.to_string()),
            ("coeff_serial", self.serial.clone().unwrap_or_default()),
            ("unit", self.unit.clone()),
        ]
    }

    /// Load a manual override file.
    pub fn load_manual(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let record: ManualCoefficientFile = serde_json::from_str(&text).map_err(|e| {
            TerpsError::Configuration(format!(
                "manual coefficient file '{}': {}",
                path.display(),
                e
            ))
        })?;
        record.into_set().map_err(|e| {
            TerpsError::Configuration(format!(
                "manual coefficient file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the set in the manual override format.
    pub fn save_manual(&self, path: &Path) -> AppResult<()> {
        let record = ManualCoefficientFile::from(self);
        let text = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Free-function form of [`CoefficientSet::metadata`].
pub fn coefficient_metadata(set: &CoefficientSet) -> Vec<(&'static str, String)> {
    set.metadata()
}

fn default_unit() -> String {
    DEFAULT_UNIT.to_string()
}

/// On-disk shape of a manual coefficient override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualCoefficientFile {
    /// Reported polynomial order
    pub order: usize,
    /// Unit label
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Sensor serial
    #[serde(default)]
    pub serial: Option<String>,
    /// Frequency reference point
    pub x_ref: f64,
    /// Voltage reference point
    pub y_ref: f64,
    /// Highest frequency power
    pub nx: usize,
    /// Highest voltage power
    pub ny: usize,
    /// Flattened row-major coefficients
    pub a: Vec<f64>,
    /// Product string
    #[serde(default)]
    pub product: Option<String>,
}

impl ManualCoefficientFile {
    /// Validate dimensions and build a manual-provenance set.
    pub fn into_set(self) -> Result<CoefficientSet, CoefficientError> {
        let set = CoefficientSet::new(
            Provenance::Manual,
            self.nx,
            self.ny,
            self.a,
            self.x_ref,
            self.y_ref,
            self.unit,
        )?;
        Ok(set
            .with_order(self.order)
            .with_serial(self.serial)
            .with_product(self.product.filter(|p| !p.is_empty())))
    }
}

impl From<&CoefficientSet> for ManualCoefficientFile {
    fn from(set: &CoefficientSet) -> Self {
        Self {
            order: set.order,
            unit: set.unit.clone(),
            serial: set.serial.clone(),
            x_ref: set.x_ref,
            y_ref: set.y_ref,
            nx: set.nx,
            ny: set.ny,
            a: set.coefficients.clone(),
            product: set.product.clone(),
        }
    }
}
