//! Scan configuration using Figment
//!
//! Configuration is loaded from:
//! 1. Built-in defaults (the values the rig was tuned with)
//! 2. A TOML file (e.g. `config/stepscan.toml`)
//! 3. Environment variables (prefixed with `STEPSCAN_`, sections split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! STEPSCAN_APPLICATION__LOG_LEVEL=debug
//! STEPSCAN_SCAN__STEP_COUNT=10
//! STEPSCAN_STAGE__SERIAL=27601295
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stepscan::config::ScanConfig;
//!
//! let config = ScanConfig::load_from("config/stepscan.toml")?;
//! println!("Steps: {}", config.scan.step_count);
//! # Ok::<(), stepscan::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::experiment::ScanPlan;
use crate::instrument::camera::{AcquisitionConfig, Binning, OutputFormat, TriggerSettings};
use crate::instrument::stage::{StageTimings, TravelLimits};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level scan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Motorized stage settings
    #[serde(default)]
    pub stage: StageConfig,
    /// Camera acquisition settings
    #[serde(default)]
    pub camera: CameraConfig,
    /// Step plan
    #[serde(default)]
    pub scan: ScanSection,
    /// Frame output settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "stepscan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Controller serial number
    pub serial: String,
    /// Named motion profile loaded before any move
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Home the actuator during initialization
    #[serde(default = "default_true")]
    pub home: bool,
    /// Upper travel limit in millimeters
    #[serde(default = "default_max_position")]
    pub max_position_mm: f64,
    /// Position polling interval requested from the driver
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    /// Pause after connect, polling start and enable
    #[serde(default = "default_init_settle")]
    pub init_settle_ms: u64,
    /// Bound on the settings-initialized wait
    #[serde(default = "default_settings_timeout")]
    pub settings_timeout_ms: u64,
    /// Bound on the homing move
    #[serde(default = "default_homing_timeout")]
    pub homing_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            serial: "27601295".to_string(),
            profile: default_profile(),
            home: true,
            max_position_mm: default_max_position(),
            polling_interval_ms: default_polling_interval(),
            init_settle_ms: default_init_settle(),
            settings_timeout_ms: default_settings_timeout(),
            homing_timeout_ms: default_homing_timeout(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Sensor pixel format selected on the device
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Format frames are converted to before writing
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Exposure time in microseconds (unset keeps the device value)
    #[serde(default)]
    pub exposure_us: Option<f64>,
    /// Analog gain (unset keeps the device value)
    #[serde(default)]
    pub gain: Option<f64>,
    /// Acquisition frame rate in Hz (unset keeps the device value)
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Horizontal binning factor
    #[serde(default = "default_binning")]
    pub binning_horizontal: i64,
    /// Vertical binning factor
    #[serde(default = "default_binning")]
    pub binning_vertical: i64,
    /// Mirror the image horizontally
    #[serde(default)]
    pub reverse_x: bool,
    /// Mirror the image vertically
    #[serde(default)]
    pub reverse_y: bool,
    /// Enable ADC gain correction
    #[serde(default = "default_true")]
    pub adc_gain_correction: bool,
    /// Trigger selector entry
    #[serde(default = "default_trigger_selector")]
    pub trigger_selector: String,
    /// Trigger source entry
    #[serde(default = "default_trigger_source")]
    pub trigger_source: String,
    /// Trigger mode entry
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: String,
    /// Bound on the filled-buffer wait per capture
    #[serde(default = "default_buffer_timeout")]
    pub buffer_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            pixel_format: default_pixel_format(),
            output_format: OutputFormat::default(),
            exposure_us: None,
            gain: None,
            frame_rate: None,
            binning_horizontal: default_binning(),
            binning_vertical: default_binning(),
            reverse_x: false,
            reverse_y: false,
            adc_gain_correction: true,
            trigger_selector: default_trigger_selector(),
            trigger_source: default_trigger_source(),
            trigger_mode: default_trigger_mode(),
            buffer_timeout_ms: default_buffer_timeout(),
        }
    }
}

/// Step plan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSection {
    /// Relative move per iteration in millimeters
    #[serde(default = "default_step_size")]
    pub step_size_mm: f64,
    /// Number of move+capture iterations
    #[serde(default = "default_step_count")]
    pub step_count: u32,
    /// Absolute start position in millimeters
    #[serde(default)]
    pub initial_position_mm: f64,
    /// Mechanical settling time after each move
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            step_size_mm: default_step_size(),
            step_count: default_step_count(),
            initial_position_mm: 0.0,
            settle_ms: default_settle(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory PNG frames are written to (created if absent)
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("frames"),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    "MTS25/M-Z8".to_string()
}

fn default_max_position() -> f64 {
    25.0
}

fn default_polling_interval() -> u64 {
    250
}

fn default_init_settle() -> u64 {
    250
}

fn default_settings_timeout() -> u64 {
    10_000
}

fn default_homing_timeout() -> u64 {
    60_000
}

fn default_pixel_format() -> String {
    "Mono12g24IDS".to_string()
}

fn default_binning() -> i64 {
    1
}

fn default_trigger_selector() -> String {
    "ReadOutStart".to_string()
}

fn default_trigger_source() -> String {
    "Software".to_string()
}

fn default_trigger_mode() -> String {
    "On".to_string()
}

fn default_buffer_timeout() -> u64 {
    2000
}

fn default_step_size() -> f64 {
    0.8 / 1000.0
}

fn default_step_count() -> u32 {
    31
}

fn default_settle() -> u64 {
    1000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScanConfig {
    /// Load configuration from a TOML file layered over the defaults,
    /// then apply `STEPSCAN_` environment overrides.
    ///
    /// A missing file is not an error; the defaults and environment are used.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STEPSCAN_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Stage serial is set and travel limit is positive
    /// - Step size and initial position are finite
    /// - Binning factors and buffer timeout are positive
    /// - Output directory is not empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.stage.serial.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "stage.serial must not be empty".to_string(),
            ));
        }

        if !self.stage.max_position_mm.is_finite() || self.stage.max_position_mm <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stage.max_position_mm {}. Must be a positive number",
                self.stage.max_position_mm
            )));
        }

        if !self.scan.step_size_mm.is_finite() || !self.scan.initial_position_mm.is_finite() {
            return Err(ConfigError::ValidationError(
                "scan.step_size_mm and scan.initial_position_mm must be finite".to_string(),
            ));
        }

        if self.camera.binning_horizontal < 1 || self.camera.binning_vertical < 1 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid binning {}x{}. Factors must be at least 1",
                self.camera.binning_horizontal, self.camera.binning_vertical
            )));
        }

        if self.camera.buffer_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "camera.buffer_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.output.directory.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "output.directory must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Travel limits of the configured stage.
    pub fn travel_limits(&self) -> TravelLimits {
        TravelLimits::new(self.stage.max_position_mm)
    }

    /// Wait bounds used while bringing the stage up.
    pub fn stage_timings(&self) -> StageTimings {
        StageTimings {
            polling_interval: Duration::from_millis(self.stage.polling_interval_ms),
            init_settle: Duration::from_millis(self.stage.init_settle_ms),
            settings_timeout: Duration::from_millis(self.stage.settings_timeout_ms),
            homing_timeout: Duration::from_millis(self.stage.homing_timeout_ms),
        }
    }

    /// Immutable acquisition snapshot for one camera session.
    pub fn acquisition(&self) -> AcquisitionConfig {
        let camera = &self.camera;
        AcquisitionConfig {
            reverse_x: camera.reverse_x,
            reverse_y: camera.reverse_y,
            binning: Binning {
                horizontal: camera.binning_horizontal,
                vertical: camera.binning_vertical,
            },
            pixel_format: camera.pixel_format.clone(),
            exposure_us: camera.exposure_us,
            gain: camera.gain,
            adc_gain_correction: camera.adc_gain_correction,
            frame_rate: camera.frame_rate,
            trigger: TriggerSettings {
                selector: camera.trigger_selector.clone(),
                source: camera.trigger_source.clone(),
                mode: camera.trigger_mode.clone(),
            },
            output_format: camera.output_format,
            buffer_timeout: Duration::from_millis(camera.buffer_timeout_ms),
        }
    }

    /// Step plan described by the `[scan]` section.
    pub fn plan(&self) -> ScanPlan {
        ScanPlan {
            step_size_mm: self.scan.step_size_mm,
            step_count: self.scan.step_count,
            initial_position_mm: self.scan.initial_position_mm,
            settle: Duration::from_millis(self.scan.settle_ms),
            home: self.stage.home,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_rig_tuning() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stage.profile, "MTS25/M-Z8");
        assert_eq!(config.stage.max_position_mm, 25.0);
        assert_eq!(config.scan.step_count, 31);
        assert!((config.scan.step_size_mm - 0.0008).abs() < 1e-12);
        assert_eq!(config.camera.pixel_format, "Mono12g24IDS");
        assert_eq!(config.camera.buffer_timeout_ms, 2000);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = ScanConfig::from_toml_str(
            r#"
            [stage]
            serial = "83000001"
            home = false

            [scan]
            step_count = 5
            settle_ms = 10

            [camera]
            exposure_us = 6000.0
            output_format = "mono16"
            "#,
        )
        .unwrap();

        assert_eq!(config.stage.serial, "83000001");
        assert!(!config.stage.home);
        assert_eq!(config.stage.profile, "MTS25/M-Z8");
        assert_eq!(config.scan.step_count, 5);
        assert_eq!(config.camera.exposure_us, Some(6000.0));
        assert_eq!(config.camera.output_format, OutputFormat::Mono16);
        assert!(!config.plan().home);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = ScanConfig::from_toml_str(
            r#"
            [application]
            name = "stepscan"
            log_level = "loud"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_non_positive_travel_rejected() {
        let mut config = ScanConfig::default();
        config.stage.max_position_mm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_binning_rejected() {
        let mut config = ScanConfig::default();
        config.camera.binning_vertical = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acquisition_snapshot() {
        let config = ScanConfig::default();
        let acquisition = config.acquisition();
        assert_eq!(acquisition.binning.horizontal, 1);
        assert_eq!(acquisition.trigger.source, "Software");
        assert_eq!(acquisition.buffer_timeout, Duration::from_millis(2000));
        assert!(acquisition.exposure_us.is_none());
    }
}
