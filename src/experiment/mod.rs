//! Scan orchestration
//!
//! Sequences the stage and the camera through one step-and-capture run.
//!
//! # Run States
//!
//! ```text
//! Idle -> Initializing -> Homing (optional) -> Streaming
//!                                                  |
//!                                   Stepping <-> Capturing  (step_count times)
//!                                                  |
//!                     any error --------------> Teardown -> Closed
//! ```
//!
//! Every exit path, a panic included, passes through `Teardown`, which
//! closes the camera, the stage and the camera library exactly once.

pub mod orchestrator;
pub mod plan;

use chrono::{DateTime, Local};
use std::path::PathBuf;

pub use orchestrator::{ExperimentOrchestrator, Rig, RunState, ScanReport};
pub use plan::ScanPlan;

/// One persisted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// When the filled buffer was received.
    pub timestamp: DateTime<Local>,
    /// Zero-based loop iteration.
    pub sequence_index: usize,
    /// Written PNG file.
    pub output_path: PathBuf,
}
