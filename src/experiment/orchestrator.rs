//! Step-and-capture run loop.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{FrameRecord, ScanPlan};
use crate::config::ScanConfig;
use crate::error::{ConfigurationWarning, ScanError, ScanResult};
use crate::hardware::capabilities::{CameraSystem, ImageCodec, StageManager};
use crate::instrument::camera::{CameraSession, StreamingSession};
use crate::instrument::frame_pool::FrameBufferPool;
use crate::instrument::library::CameraLibrary;
use crate::instrument::stage::MotionController;

/// The hardware a scan runs against.
#[derive(Clone)]
pub struct Rig {
    /// Stage discovery.
    pub stages: Arc<dyn StageManager>,
    /// Camera SDK library.
    pub cameras: Arc<dyn CameraSystem>,
    /// Frame decoding and persistence.
    pub codec: Arc<dyn ImageCodec>,
}

/// Orchestrator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing opened yet
    Idle,
    /// Opening and configuring the stage and camera
    Initializing,
    /// Homing the stage
    Homing,
    /// Starting the camera stream
    Streaming,
    /// Relative move of one step
    Stepping,
    /// Triggered capture of one frame
    Capturing,
    /// Releasing every device
    Teardown,
    /// Run finished, all devices released
    Closed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Homing => write!(f, "Homing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Stepping => write!(f, "Stepping"),
            Self::Capturing => write!(f, "Capturing"),
            Self::Teardown => write!(f, "Teardown"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Outcome of one run.
#[derive(Debug)]
pub struct ScanReport {
    /// Every persisted frame, in capture order.
    pub frames: Vec<FrameRecord>,
    /// Stage position read during teardown.
    pub final_position_mm: Option<f64>,
    /// Visited states, in order.
    pub states: Vec<RunState>,
    /// Camera properties that could not be applied.
    pub warnings: Vec<ConfigurationWarning>,
    /// The error that ended the run early.
    pub error: Option<ScanError>,
}

impl ScanReport {
    /// Whether every planned iteration completed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit code: 0 on success.
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, ScanError::exit_code)
    }
}

enum Camera {
    Idle(CameraSession),
    Streaming(StreamingSession),
}

/// Owns the stage, the camera and the camera library for one run at a time.
///
/// # Example
///
/// ```rust,ignore
/// let mut orchestrator = ExperimentOrchestrator::new(rig, config.clone());
/// let report = orchestrator.run(&config.plan()).await;
/// std::process::exit(report.exit_code());
/// ```
pub struct ExperimentOrchestrator {
    rig: Rig,
    config: ScanConfig,
    state: RunState,
    states: Vec<RunState>,
    library: Option<CameraLibrary>,
    stage: Option<MotionController>,
    camera: Option<Camera>,
    frames: Vec<FrameRecord>,
    warnings: Vec<ConfigurationWarning>,
    final_position_mm: Option<f64>,
}

impl ExperimentOrchestrator {
    /// Create an idle orchestrator.
    pub fn new(rig: Rig, config: ScanConfig) -> Self {
        Self {
            rig,
            config,
            state: RunState::Idle,
            states: vec![RunState::Idle],
            library: None,
            stage: None,
            camera: None,
            frames: Vec::new(),
            warnings: Vec::new(),
            final_position_mm: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute `plan` and release every device before returning.
    ///
    /// Errors end the loop and are reported in the [`ScanReport`]. A panic
    /// inside the run is resumed after teardown.
    pub async fn run(&mut self, plan: &ScanPlan) -> ScanReport {
        self.state = RunState::Idle;
        self.states = vec![RunState::Idle];
        self.frames.clear();
        self.warnings.clear();
        self.final_position_mm = None;

        info!(
            steps = plan.step_count,
            step_size_mm = plan.step_size_mm,
            initial_position_mm = plan.initial_position_mm,
            "Scan starting"
        );

        let outcome = AssertUnwindSafe(self.execute(plan)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(state = %self.state, "Scan panicked; releasing devices");
                self.teardown().await;
                std::panic::resume_unwind(panic);
            }
        };
        self.teardown().await;

        let error = match result {
            Ok(()) => {
                info!(frames = self.frames.len(), "Scan complete");
                None
            }
            Err(e) => {
                error!(
                    error = %e,
                    fatal = e.is_fatal(),
                    frames = self.frames.len(),
                    "Scan aborted"
                );
                Some(e)
            }
        };

        ScanReport {
            frames: std::mem::take(&mut self.frames),
            final_position_mm: self.final_position_mm,
            states: self.states.clone(),
            warnings: std::mem::take(&mut self.warnings),
            error,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state");
        self.state = next;
        self.states.push(next);
    }

    fn stage_mut(&mut self) -> ScanResult<&mut MotionController> {
        self.stage
            .as_mut()
            .ok_or_else(|| ScanError::Connection("stage is not open".to_string()))
    }

    fn streaming_mut(&mut self) -> ScanResult<&mut StreamingSession> {
        match self.camera.as_mut() {
            Some(Camera::Streaming(session)) => Ok(session),
            _ => Err(ScanError::Connection("camera is not streaming".to_string())),
        }
    }

    async fn execute(&mut self, plan: &ScanPlan) -> ScanResult<()> {
        self.transition(RunState::Initializing);
        self.open_stage().await?;
        if plan.home {
            self.transition(RunState::Homing);
            self.stage_mut()?.home().await?;
        }
        let position = self
            .stage_mut()?
            .move_absolute(plan.initial_position_mm)
            .await?;
        info!(position_mm = position, "At start position");
        tokio::time::sleep(plan.settle).await;
        self.open_camera().await?;

        self.transition(RunState::Streaming);
        self.start_stream().await?;

        let codec = Arc::clone(&self.rig.codec);
        let output_dir: PathBuf = self.config.output.directory.clone();
        for index in 0..plan.step_count as usize {
            self.transition(RunState::Stepping);
            let position = self.stage_mut()?.move_relative(plan.step_size_mm).await?;
            debug!(step = index, position_mm = position, "Step complete");
            tokio::time::sleep(plan.settle).await;

            self.transition(RunState::Capturing);
            let record = self
                .streaming_mut()?
                .capture_one(codec.as_ref(), &output_dir, index)
                .await?;
            self.frames.push(record);
        }
        Ok(())
    }

    async fn open_stage(&mut self) -> ScanResult<()> {
        let stage = MotionController::create(
            self.rig.stages.as_ref(),
            &self.config.stage.serial,
            self.config.travel_limits(),
        )
        .await?
        .with_timings(self.config.stage_timings());
        self.stage = Some(stage);

        let profile = self.config.stage.profile.clone();
        self.stage_mut()?.initialize(false, &profile).await
    }

    async fn open_camera(&mut self) -> ScanResult<()> {
        let library = CameraLibrary::initialize(Arc::clone(&self.rig.cameras))?;
        let library = self.library.insert(library);
        let mut session = CameraSession::open(library.system()).await?;

        let warnings = session
            .apply_default_config(self.config.acquisition())
            .await;
        self.warnings.extend(warnings);
        if let Some(exposure) = session.query().exposure_time().await {
            info!(exposure_us = exposure, "Camera exposure");
        }
        self.camera = Some(Camera::Idle(session));
        Ok(())
    }

    async fn start_stream(&mut self) -> ScanResult<()> {
        let Some(camera) = self.camera.take() else {
            return Err(ScanError::Connection("camera is not open".to_string()));
        };
        let session = match camera {
            Camera::Idle(session) => session,
            Camera::Streaming(session) => {
                self.camera = Some(Camera::Streaming(session));
                return Ok(());
            }
        };
        let streaming = session.start_stream(FrameBufferPool::new()).await?;
        self.camera = Some(Camera::Streaming(streaming));
        Ok(())
    }

    /// Release the camera, then the stage, then the camera library. Every
    /// handle is taken before it is closed, so repeated calls do nothing.
    async fn teardown(&mut self) {
        if self.state == RunState::Closed {
            return;
        }
        self.transition(RunState::Teardown);

        let camera_result = match self.camera.take() {
            Some(Camera::Idle(session)) => session.close().await,
            Some(Camera::Streaming(session)) => session.close().await,
            None => Ok(()),
        };
        if let Err(e) = camera_result {
            warn!(error = %e, "Camera teardown failed");
        }

        if let Some(mut stage) = self.stage.take() {
            let position = stage.get_position().await;
            self.final_position_mm = Some(position);
            if let Err(e) = stage.close().await {
                warn!(error = %e, "Stage teardown failed");
            }
        }

        if let Some(library) = self.library.take() {
            library.close();
        }

        self.transition(RunState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PngCodec;
    use crate::hardware::mock::{MockCamera, MockCameraSystem, MockStage, MockStageManager};
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> ScanConfig {
        let mut config = ScanConfig::default();
        config.stage.init_settle_ms = 0;
        config.stage.settings_timeout_ms = 50;
        config.camera.buffer_timeout_ms = 30;
        config.output.directory = dir.to_path_buf();
        config
    }

    fn plan(steps: u32) -> ScanPlan {
        ScanPlan {
            step_count: steps,
            settle: Duration::from_millis(1),
            ..ScanPlan::default()
        }
    }

    fn rig(stage: &MockStage, cameras: &MockCameraSystem) -> Rig {
        Rig {
            stages: Arc::new(MockStageManager::new(stage.clone())),
            cameras: Arc::new(cameras.clone()),
            codec: Arc::new(PngCodec::new()),
        }
    }

    #[tokio::test]
    async fn test_state_sequence_of_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let stage = MockStage::new("27601295");
        let cameras = MockCameraSystem::new(MockCamera::new());
        let mut orchestrator = ExperimentOrchestrator::new(rig(&stage, &cameras), config(dir.path()));

        let report = orchestrator.run(&plan(2)).await;

        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(
            report.states,
            vec![
                RunState::Idle,
                RunState::Initializing,
                RunState::Homing,
                RunState::Streaming,
                RunState::Stepping,
                RunState::Capturing,
                RunState::Stepping,
                RunState::Capturing,
                RunState::Teardown,
                RunState::Closed,
            ]
        );
        assert_eq!(orchestrator.state(), RunState::Closed);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_no_homing_skips_state() {
        let dir = tempfile::tempdir().unwrap();
        let stage = MockStage::new("27601295").with_homing_failure();
        let cameras = MockCameraSystem::new(MockCamera::new());
        let mut orchestrator = ExperimentOrchestrator::new(rig(&stage, &cameras), config(dir.path()));

        let report = orchestrator
            .run(&ScanPlan {
                home: false,
                ..plan(1)
            })
            .await;

        assert!(report.is_success());
        assert!(!report.states.contains(&RunState::Homing));
    }

    #[tokio::test]
    async fn test_missing_stage_still_closes_camera_library() {
        let dir = tempfile::tempdir().unwrap();
        let stage = MockStage::new("11111111");
        let cameras = MockCameraSystem::new(MockCamera::new());
        let mut orchestrator = ExperimentOrchestrator::new(rig(&stage, &cameras), config(dir.path()));

        let report = orchestrator.run(&plan(3)).await;

        assert!(matches!(report.error, Some(ScanError::DeviceNotFound { .. })));
        assert_eq!(report.exit_code(), -1);
        assert_eq!(cameras.initialize_count(), 0);
        assert_eq!(report.final_position_mm, None);
    }

    #[tokio::test]
    async fn test_second_run_reopens_devices() {
        let dir = tempfile::tempdir().unwrap();
        let stage = MockStage::new("27601295");
        let camera = MockCamera::new();
        let cameras = MockCameraSystem::new(camera.clone());
        let mut orchestrator = ExperimentOrchestrator::new(rig(&stage, &cameras), config(dir.path()));

        let first = orchestrator.run(&plan(1)).await;
        let second = orchestrator.run(&plan(1)).await;

        assert!(first.is_success() && second.is_success());
        assert_eq!(second.frames.len(), 1);
        assert_eq!(camera.close_count(), 2);
        assert_eq!(cameras.close_count(), 2);
        assert_eq!(stage.disconnect_count(), 2);
    }
}
