//! Rolling overlapping Allan deviation of the measured frequency.

use std::collections::VecDeque;

/// Keeps the last `window` frequency readings.
#[derive(Debug, Clone)]
pub struct AllanWindow {
    window: usize,
    samples: VecDeque<f64>,
}

impl AllanWindow {
    /// Window over `window` samples; `0` disables tracking.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Whether tracking is enabled.
    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    /// Number of readings held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no readings are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add a reading, evicting the oldest once full.
    pub fn push(&mut self, f_hz: f64) {
        if self.window == 0 {
            return;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(f_hz);
    }

    /// Allan deviation over the whole window at averaging time `tau_s`.
    ///
    /// `None` with fewer than three readings or a non-positive `tau_s`.
    pub fn deviation(&self, tau_s: f64) -> Option<f64> {
        if self.samples.len() < 3 || tau_s <= 0.0 {
            return None;
        }
        let (sum_sq, count) = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .zip(self.samples.iter().skip(2))
            .map(|((a, b), c)| c - 2.0 * b + a)
            .fold((0.0, 0usize), |(sum, n), d| (sum + d * d, n + 1));
        Some((0.5 * sum_sq / (tau_s * tau_s * count as f64)).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_and_linear_drift_have_zero_deviation() {
        let mut window = AllanWindow::new(8);
        for i in 0..8 {
            window.push(100.0 + i as f64);
        }
        assert_eq!(window.deviation(0.1), Some(0.0));
    }

    #[test]
    fn alternating_signal() {
        let mut window = AllanWindow::new(4);
        for f in [0.0, 1.0, 0.0, 1.0, 0.0] {
            window.push(f);
        }
        // window holds [1, 0, 1, 0]; second differences are ±2
        assert_eq!(window.len(), 4);
        assert_eq!(window.deviation(1.0), Some(2.0_f64.sqrt()));
    }

    #[test]
    fn disabled_and_short_windows() {
        let mut disabled = AllanWindow::new(0);
        disabled.push(1.0);
        assert!(!disabled.is_enabled());
        assert!(disabled.is_empty());

        let mut short = AllanWindow::new(10);
        short.push(1.0);
        short.push(2.0);
        assert_eq!(short.deviation(1.0), None);
    }
}
