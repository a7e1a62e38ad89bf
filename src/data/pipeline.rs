//! Frame to sample conversion.
//!
//! [`SamplePipeline`] owns the active [`CoefficientSet`], evaluates the calibration
//! surface for every frame, appends the result to the optional [`SampleLog`] and
//! fans it out to registered observers.

use crate::coeff::{coefficient_metadata, CoefficientSet};
use crate::data::sample_log::SampleLog;
use crate::error::AppResult;
use crate::protocol::{Frame, OperatingMode};
use serde::Serialize;
use tracing::info;

/// Calibration polynomial `P(f, v) = Σ_i Σ_j K[i][j]·(f − x_ref)^i·(v − y_ref)^j`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialSurface {
    x_ref: f64,
    y_ref: f64,
    cols: usize,
    coefficients: Vec<f64>,
}

impl PolynomialSurface {
    /// Evaluator for `set`.
    pub fn from_set(set: &CoefficientSet) -> Self {
        Self {
            x_ref: set.x_ref(),
            y_ref: set.y_ref(),
            cols: set.ny() + 1,
            coefficients: set.coefficients().to_vec(),
        }
    }

    /// Evaluate at frequency `f_hz` and diode voltage `v_uv`.
    pub fn evaluate(&self, f_hz: f64, v_uv: f64) -> f64 {
        let dx = f_hz - self.x_ref;
        let dy = v_uv - self.y_ref;
        // Nested Horner: outer over frequency powers, inner over voltage powers.
        self.coefficients
            .chunks(self.cols)
            .rev()
            .fold(0.0, |acc, row| {
                let row_value = row.iter().rev().fold(0.0, |inner, k| inner * dy + k);
                acc * dx + row_value
            })
    }
}

/// A frame with its computed pressure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Device timestamp (ms)
    pub ts_ms: f64,
    /// Measured frequency (Hz)
    pub frequency_hz: f64,
    /// Gate / reciprocal time constant (ms)
    pub tau_ms: f64,
    /// Diode voltage (µV)
    #[serde(rename = "diode_uV")]
    pub diode_uv: f64,
    /// Calibrated pressure, in the coefficient set's unit
    pub pressure: f64,
    /// ADC gain setting
    pub adc_gain: u8,
    /// Device status bitfield
    pub flags: u8,
    /// Timebase correction (ppm)
    pub ppm_corr: f64,
    /// Counting mode
    pub mode: OperatingMode,
}

impl SampleRecord {
    fn from_frame(frame: &Frame, pressure: f64) -> Self {
        Self {
            ts_ms: frame.ts_ms,
            frequency_hz: frame.f_hz,
            tau_ms: frame.tau_ms,
            diode_uv: frame.v_uv,
            pressure,
            adc_gain: frame.adc_gain,
            flags: frame.flags,
            ppm_corr: frame.ppm_corr,
            mode: frame.mode,
        }
    }
}

/// Receives every processed sample.
pub trait SampleObserver: Send {
    /// Called once per sample, after it was logged.
    fn on_sample(&mut self, sample: &SampleRecord);
}

impl<F> SampleObserver for F
where
    F: FnMut(&SampleRecord) + Send,
{
    fn on_sample(&mut self, sample: &SampleRecord) {
        self(sample)
    }
}

/// Notified when the active coefficient set changes.
pub trait CoefficientObserver: Send {
    /// Called with the newly active set.
    fn on_coefficients(&mut self, set: &CoefficientSet);
}

impl<F> CoefficientObserver for F
where
    F: FnMut(&CoefficientSet) + Send,
{
    fn on_coefficients(&mut self, set: &CoefficientSet) {
        self(set)
    }
}

/// Converts frames into samples.
pub struct SamplePipeline {
    coefficients: CoefficientSet,
    surface: PolynomialSurface,
    log: Option<SampleLog>,
    sample_observers: Vec<Box<dyn SampleObserver>>,
    coefficient_observers: Vec<Box<dyn CoefficientObserver>>,
    samples: u64,
}

impl SamplePipeline {
    /// Pipeline evaluating `coefficients`, logging to `log` when given.
    ///
    /// The coefficient tags are queued on the log immediately; nothing touches the
    /// filesystem until the first sample.
    pub fn new(coefficients: CoefficientSet, mut log: Option<SampleLog>) -> AppResult<Self> {
        if let Some(log) = log.as_mut() {
            log.set_metadata(&coefficient_metadata(&coefficients))?;
        }
        Ok(Self {
            surface: PolynomialSurface::from_set(&coefficients),
            coefficients,
            log,
            sample_observers: Vec::new(),
            coefficient_observers: Vec::new(),
            samples: 0,
        })
    }

    /// Register a sample observer.
    pub fn add_sample_observer(&mut self, observer: impl SampleObserver + 'static) {
        self.sample_observers.push(Box::new(observer));
    }

    /// Register a coefficient observer.
    pub fn add_coefficient_observer(&mut self, observer: impl CoefficientObserver + 'static) {
        self.coefficient_observers.push(Box::new(observer));
    }

    /// The set currently used for evaluation.
    pub fn coefficients(&self) -> &CoefficientSet {
        &self.coefficients
    }

    /// Samples processed so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Evaluate, log and publish one frame.
    pub fn process(&mut self, frame: &Frame) -> AppResult<SampleRecord> {
        let pressure = self.surface.evaluate(frame.f_hz, frame.v_uv);
        let sample = SampleRecord::from_frame(frame, pressure);
        if let Some(log) = self.log.as_mut() {
            log.append(&sample)?;
        }
        for observer in &mut self.sample_observers {
            observer.on_sample(&sample);
        }
        self.samples += 1;
        Ok(sample)
    }

    /// Swap in a new coefficient set.
    pub fn update_coefficients(&mut self, set: CoefficientSet) -> AppResult<()> {
        info!(
            source = %set.provenance(),
            serial = set.serial().unwrap_or("-"),
            order = set.order(),
            "pipeline coefficients updated"
        );
        self.surface = PolynomialSurface::from_set(&set);
        if let Some(log) = self.log.as_mut() {
            log.set_metadata(&coefficient_metadata(&set))?;
        }
        for observer in &mut self.coefficient_observers {
            observer.on_coefficients(&set);
        }
        self.coefficients = set;
        Ok(())
    }

    /// Flush and close the sample log.
    pub fn close(&mut self) -> AppResult<()> {
        match self.log.as_mut() {
            Some(log) => log.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::Provenance;
    use std::sync::{Arc, Mutex};

    fn frame(f_hz: f64, v_uv: f64) -> Frame {
        Frame {
            ts_ms: 1.0,
            f_hz,
            tau_ms: 100.0,
            v_uv,
            adc_gain: 16,
            flags: 0,
            ppm_corr: 0.0,
            mode: OperatingMode::Recip,
        }
    }

    fn set(x_ref: f64, y_ref: f64, matrix: &[Vec<f64>]) -> CoefficientSet {
        CoefficientSet::from_matrix(Provenance::Config, x_ref, y_ref, matrix, "Pa").unwrap()
    }

    #[test]
    fn cross_term_only() {
        let k = 0.5;
        let surface = PolynomialSurface::from_set(&set(
            30_000.0,
            600_000.0,
            &[vec![0.0, 0.0], vec![0.0, k]],
        ));
        assert_eq!(surface.evaluate(30_001.0, 600_123.0), 123.0 * k);
    }

    #[test]
    fn full_surface_matches_direct_sum() {
        let matrix = vec![
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
        ];
        let surface = PolynomialSurface::from_set(&set(10.0, 20.0, &matrix));
        let (dx, dy) = (2.0_f64, 3.0_f64);
        let mut expected = 0.0;
        for (i, row) in matrix.iter().enumerate() {
            for (j, k) in row.iter().enumerate() {
                expected += k * dx.powi(i as i32) * dy.powi(j as i32);
            }
        }
        assert_eq!(surface.evaluate(12.0, 23.0), expected);
    }

    #[test]
    fn process_notifies_observers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut pipeline =
            SamplePipeline::new(set(0.0, 0.0, &[vec![1.0, 0.0], vec![2.0, 0.0]]), None).unwrap();
        pipeline.add_sample_observer(move |sample: &SampleRecord| {
            sink.lock().unwrap().push(sample.pressure);
        });

        let sample = pipeline.process(&frame(10.0, 0.0)).unwrap();
        assert_eq!(sample.pressure, 21.0);
        assert_eq!(sample.frequency_hz, 10.0);
        assert_eq!(pipeline.samples(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![21.0]);
    }

    #[test]
    fn coefficient_update_is_visible() {
        let swaps = Arc::new(Mutex::new(0));
        let counter = swaps.clone();
        let mut pipeline = SamplePipeline::new(set(0.0, 0.0, &[vec![1.0]]), None).unwrap();
        pipeline.add_coefficient_observer(move |_: &CoefficientSet| {
            *counter.lock().unwrap() += 1;
        });
        assert_eq!(pipeline.process(&frame(5.0, 5.0)).unwrap().pressure, 1.0);

        pipeline.update_coefficients(set(0.0, 0.0, &[vec![7.0]])).unwrap();
        assert_eq!(pipeline.process(&frame(5.0, 5.0)).unwrap().pressure, 7.0);
        assert_eq!(pipeline.coefficients().coefficients(), &[7.0]);
        assert_eq!(*swaps.lock().unwrap(), 1);
        assert!(pipeline.close().is_ok());
    }
}
