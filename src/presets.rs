//! Named acquisition presets.
//!
//! A preset is a bundle of configuration overrides tuned for a target
//! resolution (the name encodes it: `0p02` is 0.02 Pa). Presets apply after the
//! configuration file and environment, and before `--set` overrides.

use crate::protocol::OperatingMode;
use serde::Serialize;

/// A named set of acquisition overrides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preset {
    /// Identifier used on the command line
    pub name: &'static str,
    /// Short human description
    pub description: &'static str,
    /// Counting mode
    pub mode: OperatingMode,
    /// Time constant (ms)
    pub tau_ms: f64,
    /// ADC gain
    pub adc_gain: u8,
    /// ADC rate (samples per second)
    pub adc_rate_sps: u32,
}

const PRESETS: [Preset; 3] = [
    Preset {
        name: "0p02",
        description: "0.02 Pa resolution, fast update",
        mode: OperatingMode::Recip,
        tau_ms: 100.0,
        adc_gain: 16,
        adc_rate_sps: 50,
    },
    Preset {
        name: "0p01",
        description: "0.01 Pa resolution",
        mode: OperatingMode::Recip,
        tau_ms: 200.0,
        adc_gain: 16,
        adc_rate_sps: 20,
    },
    Preset {
        name: "0p003",
        description: "0.003 Pa resolution, slow update",
        mode: OperatingMode::Recip,
        tau_ms: 500.0,
        adc_gain: 32,
        adc_rate_sps: 20,
    },
];

impl Preset {
    /// The preset as `key=value` configuration overrides.
    pub fn overrides(&self) -> Vec<String> {
        vec![
            format!("mode={}", self.mode),
            format!("tau_ms={:?}", self.tau_ms),
            format!("adc.gain={}", self.adc_gain),
            format!("adc.rate_sps={}", self.adc_rate_sps),
        ]
    }
}

/// All built-in presets.
pub fn all() -> &'static [Preset] {
    &PRESETS
}

/// Preset names in definition order.
pub fn names() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}

/// Look up a preset by name (case-insensitive).
pub fn find(name: &str) -> Option<&'static Preset> {
    let name = name.trim();
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}
