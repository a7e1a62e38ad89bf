//! Configuration layering: file, preset and command-line overrides.

use std::io::Write;
use terps_host::coeff::CoefficientMode;
use terps_host::config::TerpsConfig;
use terps_host::presets;
use terps_host::protocol::{FrameFormat, OperatingMode};

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn preset_overrides_file_and_set_overrides_preset() {
    let file = config_file(
        r#"
        mode = "GATED"
        tau_ms = 50.0

        [adc]
        gain = 4
        rate_sps = 10

        [coefficients]
        mode = "config"
        refresh_interval_sec = 0.2
        "#,
    );

    let config = TerpsConfig::load(
        Some(file.path()),
        Some("0p003"),
        &["adc.rate_sps=40".to_string(), "frame_format=binary".to_string()],
    )
    .unwrap();

    assert_eq!(config.mode, OperatingMode::Recip);
    assert_eq!(config.tau_ms, 500.0);
    assert_eq!(config.adc.gain, 32);
    assert_eq!(config.adc.rate_sps, 40);
    assert_eq!(config.frame_format, FrameFormat::Binary);
    assert_eq!(config.coefficients.mode, CoefficientMode::Config);
    assert!(config.validate().is_ok());
}

#[test]
fn every_preset_loads_and_validates() {
    for preset in presets::all() {
        let config = TerpsConfig::load(None, Some(preset.name), &[]).unwrap();
        assert_eq!(config.tau_ms, preset.tau_ms, "preset {}", preset.name);
        assert_eq!(config.adc.gain, preset.adc_gain);
        assert_eq!(config.adc.rate_sps, preset.adc_rate_sps);
        config.validate().unwrap();
    }
}

#[test]
fn json_matrix_override_replaces_sensor_poly() {
    let config = TerpsConfig::load(
        None,
        None,
        &["sensor_poly.K=[[0.0, 1.5], [2.5, 0.0]]".to_string()],
    )
    .unwrap();
    assert_eq!(config.sensor_poly.k, vec![vec![0.0, 1.5], vec![2.5, 0.0]]);
    let set = config.static_default().unwrap();
    assert_eq!(set.get().nx(), 1);
    assert_eq!(set.get().ny(), 1);
}

#[test]
fn malformed_file_is_a_config_error() {
    let file = config_file("[host]\nqueue_maxsize = \"lots\"\n");
    assert!(TerpsConfig::load(Some(file.path()), None, &[]).is_err());
}
