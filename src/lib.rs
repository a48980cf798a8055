//! Synchronized stage-step and camera-capture acquisition.
//!
//! A scan moves a motorized linear stage by a fixed increment, waits for
//! the mechanics to settle, triggers one camera exposure and writes the
//! frame as a PNG, `step_count` times. Vendor SDKs are reached through the
//! capability traits in [`hardware::capabilities`]; [`hardware::mock`]
//! provides a simulated rig.
//!
//! # Modules
//!
//! - [`config`] - figment-based configuration
//! - [`error`] - `ScanError` and `ConfigurationWarning`
//! - [`data`] - frames, raw pixel formats and the PNG codec
//! - [`hardware`] - capability traits and the simulated rig
//! - [`instrument`] - stage, camera and buffer pool sessions
//! - [`experiment`] - scan plan and the run orchestrator

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;

pub use config::ScanConfig;
pub use error::{ScanError, ScanResult};
pub use experiment::{ExperimentOrchestrator, Rig, ScanPlan, ScanReport};
