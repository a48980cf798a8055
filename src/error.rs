//! Error types for the acquisition core.
//!
//! This module defines `ScanError`, the single error type returned by every
//! component of the scan. Device capability traits report opaque
//! `anyhow::Error`s; the leaf components (stage, frame pool, camera session)
//! catch those at the call site, log them with context and convert them into
//! one of the variants below. Only the orchestrator decides whether a given
//! variant ends the run.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceNotFound`**: the requested stage serial or any camera is absent.
//! - **`Connection`**: a device refused a connect/enable/profile/stream call.
//! - **`SettingsTimeout`**: stage settings never reported as initialized.
//! - **`HomingFailure`**: the homing move failed or timed out.
//! - **`MoveTimeout`**: a positioning move did not finish inside its budget.
//! - **`BufferPreparation`**: the capture buffer pool could not be (re)built.
//! - **`StreamStart`**: one of the stream start sub-steps failed.
//! - **`CaptureTimeout`**: no filled buffer arrived within the capture wait.
//! - **`Capture`**: trigger, conversion or persistence of a frame failed.
//!
//! Non-fatal property failures are reported as `ConfigurationWarning`s, which
//! are collected rather than returned.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Which physical device a discovery failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// The motorized linear stage.
    Stage,
    /// The area-scan camera.
    Camera,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Stage => write!(f, "stage"),
            DeviceKind::Camera => write!(f, "camera"),
        }
    }
}

/// Sub-step of `CameraSession::start_stream` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStep {
    /// Opening the device's data stream.
    OpenStream,
    /// Preparing the capture buffer pool.
    PrepareBuffers,
    /// Starting the driver's acquisition engine.
    StartAcquisition,
    /// Locking the transport-layer parameters.
    LockParameters,
    /// Executing and waiting for the `AcquisitionStart` command.
    AcquisitionStart,
}

impl std::fmt::Display for StreamStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamStep::OpenStream => "open data stream",
            StreamStep::PrepareBuffers => "prepare buffers",
            StreamStep::StartAcquisition => "start acquisition engine",
            StreamStep::LockParameters => "lock parameters",
            StreamStep::AcquisitionStart => "acquisition start command",
        };
        f.write_str(name)
    }
}

/// Error type for every stage, camera and orchestration operation.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("No {kind} found{}", id_suffix(.id))]
    DeviceNotFound { kind: DeviceKind, id: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stage settings not initialized after {timeout_ms} ms")]
    SettingsTimeout { timeout_ms: u64 },

    #[error("Homing failed: {0}")]
    HomingFailure(String),

    #[error("Move to {target_mm:.4} mm did not complete within {timeout_ms} ms: {reason}")]
    MoveTimeout {
        target_mm: f64,
        timeout_ms: u64,
        reason: String,
    },

    #[error("Buffer preparation failed: {0}")]
    BufferPreparation(String),

    #[error("Stream start failed at '{step}': {reason}")]
    StreamStart { step: StreamStep, reason: String },

    #[error("No filled buffer within {timeout_ms} ms")]
    CaptureTimeout { timeout_ms: u64 },

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Failed to write frame to {path}: {reason}")]
    FrameWrite { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Whether the error ends the whole run.
    ///
    /// Capture-level failures only end the remaining loop iterations; the
    /// orchestrator still treats the run as aborted but tears down normally.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ScanError::CaptureTimeout { .. } | ScanError::Capture(_) | ScanError::FrameWrite { .. }
        )
    }

    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScanError::DeviceNotFound { .. } => -1,
            ScanError::StreamStart {
                step: StreamStep::OpenStream,
                ..
            } => -2,
            ScanError::BufferPreparation(_)
            | ScanError::StreamStart {
                step: StreamStep::PrepareBuffers,
                ..
            } => -3,
            ScanError::StreamStart { .. } => -4,
            ScanError::CaptureTimeout { .. }
            | ScanError::Capture(_)
            | ScanError::FrameWrite { .. } => -5,
            ScanError::Config(_) => -6,
            _ => -7,
        }
    }
}

fn id_suffix(id: &str) -> String {
    if id.is_empty() {
        String::new()
    } else {
        format!(" with id '{id}'")
    }
}

/// A camera property that could not be applied.
///
/// Configuration is best effort: one rejected property never prevents the
/// remaining ones from being set.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Could not set {property}: {reason}")]
pub struct ConfigurationWarning {
    /// Node name of the rejected property.
    pub property: &'static str,
    /// Device-reported reason.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::DeviceNotFound {
            kind: DeviceKind::Stage,
            id: "27601295".into(),
        };
        assert_eq!(err.to_string(), "No stage found with id '27601295'");

        let err = ScanError::DeviceNotFound {
            kind: DeviceKind::Camera,
            id: String::new(),
        };
        assert_eq!(err.to_string(), "No camera found");
    }

    #[test]
    fn test_stream_start_names_step() {
        let err = ScanError::StreamStart {
            step: StreamStep::LockParameters,
            reason: "node is read-only".into(),
        };
        assert!(err.to_string().contains("lock parameters"));
        assert_eq!(err.exit_code(), -4);
    }

    #[test]
    fn test_capture_errors_are_not_fatal() {
        assert!(!ScanError::CaptureTimeout { timeout_ms: 2000 }.is_fatal());
        assert!(!ScanError::Capture("trigger rejected".into()).is_fatal());
        assert!(ScanError::HomingFailure("limit switch".into()).is_fatal());
        assert!(ScanError::SettingsTimeout { timeout_ms: 10_000 }.is_fatal());
    }

    #[test]
    fn test_exit_codes_follow_startup_order() {
        let missing = ScanError::DeviceNotFound {
            kind: DeviceKind::Camera,
            id: String::new(),
        };
        assert_eq!(missing.exit_code(), -1);
        assert_eq!(
            ScanError::BufferPreparation("no memory".into()).exit_code(),
            -3
        );
        assert_eq!(ScanError::CaptureTimeout { timeout_ms: 1 }.exit_code(), -5);
    }
}
