//! Loading scan configuration from TOML files.
//!
//! Run with: cargo test --test config_loading_test

use std::io::Write;
use std::time::Duration;

use stepscan::config::{ConfigError, ScanConfig};
use stepscan::data::OutputFormat;
use stepscan::ScanError;

#[test]
fn test_bundled_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/stepscan.toml");
    let config = ScanConfig::from_toml_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(config.scan.step_count, 31);
    assert_eq!(config.stage.max_position_mm, 25.0);
}

#[test]
fn test_file_layers_over_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[scan]
step_count = 7
step_size_mm = 0.002
settle_ms = 250

[output]
directory = "/data/scan-01"
"#
    )
    .unwrap();

    let config = ScanConfig::load_from(file.path()).unwrap();
    let plan = config.plan();

    assert_eq!(plan.step_count, 7);
    assert!((plan.step_size_mm - 0.002).abs() < 1e-12);
    assert_eq!(plan.settle, Duration::from_millis(250));
    assert!(plan.home);
    assert_eq!(config.camera.trigger_mode, "On");
    assert_eq!(config.output.directory.to_str(), Some("/data/scan-01"));
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.scan.step_count, 31);
}

#[test]
fn test_malformed_file_maps_to_config_exit_code() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[scan\nstep_count = ").unwrap();

    let err = ScanConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
    assert_eq!(ScanError::from(err).exit_code(), -6);
}

#[test]
fn test_invalid_value_is_validation_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[camera]\nbuffer_timeout_ms = 0").unwrap();

    let err = ScanConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn test_output_format_accepts_device_spelling() {
    for (spelling, expected) in [
        ("Mono8", OutputFormat::Mono8),
        ("Mono12", OutputFormat::Mono12),
        ("mono16", OutputFormat::Mono16),
    ] {
        let config =
            ScanConfig::from_toml_str(&format!("[camera]\noutput_format = \"{spelling}\"")).unwrap();
        assert_eq!(config.camera.output_format, expected);
    }
}
