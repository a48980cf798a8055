//! End-to-end scans against the simulated rig.
//!
//! Run with: cargo test --test scan_orchestration_test

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use stepscan::config::ScanConfig;
use stepscan::data::PngCodec;
use stepscan::error::{DeviceKind, StreamStep};
use stepscan::experiment::RunState;
use stepscan::hardware::capabilities::NodeValue;
use stepscan::hardware::mock::{MockCamera, MockCameraSystem, MockStage, MockStageManager};
use stepscan::{ExperimentOrchestrator, Rig, ScanError};

const SERIAL: &str = "27601295";

/// Defaults with every wait shortened.
fn fast_config(output: &Path) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.stage.init_settle_ms = 0;
    config.stage.settings_timeout_ms = 50;
    config.scan.settle_ms = 1;
    config.camera.buffer_timeout_ms = 30;
    config.output.directory = output.to_path_buf();
    config
}

struct Bench {
    stage: MockStage,
    camera: MockCamera,
    cameras: MockCameraSystem,
}

impl Bench {
    fn new(stage: MockStage, camera: MockCamera) -> Self {
        let cameras = MockCameraSystem::new(camera.clone());
        Self {
            stage,
            camera,
            cameras,
        }
    }

    fn rig(&self) -> Rig {
        Rig {
            stages: Arc::new(MockStageManager::new(self.stage.clone())),
            cameras: Arc::new(self.cameras.clone()),
            codec: Arc::new(PngCodec::new()),
        }
    }

    fn assert_released(&self) {
        assert_eq!(self.stage.disconnect_count(), 1, "stage disconnects");
        assert!(!self.stage.is_connected());
        assert_eq!(self.cameras.close_count(), 1, "library closes");
        assert!(!self.cameras.is_initialized());
    }
}

#[tokio::test]
async fn test_default_plan_captures_31_frames() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(MockStage::new(SERIAL).with_position(4.0), MockCamera::new());
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.frames.len(), 31);
    assert_eq!(bench.stage.moves().len(), 1 + 31);
    assert_eq!(bench.camera.trigger_count(), 31);

    let expected = (31.0 * 0.0008f64).min(25.0);
    let final_position = report.final_position_mm.unwrap();
    assert!((final_position - expected).abs() < 1e-9);
    assert!((bench.stage.position() - expected).abs() < 1e-9);

    for (index, record) in report.frames.iter().enumerate() {
        assert_eq!(record.sequence_index, index);
        assert!(record.output_path.exists());
    }
    for pair in report.frames.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    let unique: HashSet<_> = report.frames.iter().map(|r| r.output_path.clone()).collect();
    assert_eq!(unique.len(), 31);

    bench.assert_released();
    assert_eq!(bench.camera.close_count(), 1);
}

#[tokio::test]
async fn test_capture_timeout_aborts_remaining_steps() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(MockStage::new(SERIAL), MockCamera::new().with_lost_frame_at(5));
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(report.error, Some(ScanError::CaptureTimeout { timeout_ms: 30 })));
    assert_eq!(report.exit_code(), -5);
    assert_eq!(report.frames.len(), 4);
    assert_eq!(bench.stage.moves().len(), 1 + 5);
    assert_eq!(bench.camera.trigger_count(), 5);
    assert_eq!(
        &report.states[report.states.len() - 3..],
        &[RunState::Capturing, RunState::Teardown, RunState::Closed]
    );

    bench.assert_released();
    assert_eq!(bench.camera.close_count(), 1);
    assert!(!bench.camera.is_acquiring());
    assert_eq!(bench.camera.stream().announced_count(), 0);
}

#[tokio::test]
async fn test_move_failure_aborts_loop() {
    let dir = tempfile::tempdir().unwrap();
    // move 1 is the initial positioning, so move 4 is the third step
    let bench = Bench::new(MockStage::new(SERIAL).with_move_failure_at(4), MockCamera::new());
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(report.error, Some(ScanError::MoveTimeout { .. })));
    assert_eq!(report.frames.len(), 2);
    assert_eq!(bench.camera.trigger_count(), 2);
    bench.assert_released();
    assert_eq!(bench.camera.close_count(), 1);
}

#[tokio::test]
async fn test_missing_camera_closes_stage() {
    let dir = tempfile::tempdir().unwrap();
    let stage = MockStage::new(SERIAL);
    let cameras = MockCameraSystem::empty();
    let rig = Rig {
        stages: Arc::new(MockStageManager::new(stage.clone())),
        cameras: Arc::new(cameras.clone()),
        codec: Arc::new(PngCodec::new()),
    };
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(rig, config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(
        report.error,
        Some(ScanError::DeviceNotFound {
            kind: DeviceKind::Camera,
            ..
        })
    ));
    assert_eq!(report.exit_code(), -1);
    assert!(report.frames.is_empty());
    assert_eq!(stage.disconnect_count(), 1);
    assert_eq!(cameras.close_count(), 1);
}

#[tokio::test]
async fn test_homing_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(MockStage::new(SERIAL).with_homing_failure(), MockCamera::new());
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(report.error, Some(ScanError::HomingFailure(_))));
    assert!(report.error.as_ref().unwrap().is_fatal());
    assert!(bench.stage.moves().is_empty());
    assert_eq!(bench.cameras.initialize_count(), 0);
    assert_eq!(bench.stage.disconnect_count(), 1);
}

#[tokio::test]
async fn test_settings_timeout_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(
        MockStage::new(SERIAL).with_settings_never_initialized(),
        MockCamera::new(),
    );
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(report.error, Some(ScanError::SettingsTimeout { timeout_ms: 50 })));
    assert_eq!(bench.stage.disconnect_count(), 1);
}

#[tokio::test]
async fn test_stream_start_failure_names_step() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(
        MockStage::new(SERIAL),
        MockCamera::new().with_acquisition_start_failure(),
    );
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(matches!(
        report.error,
        Some(ScanError::StreamStart {
            step: StreamStep::AcquisitionStart,
            ..
        })
    ));
    assert_eq!(report.exit_code(), -4);
    assert!(report.frames.is_empty());
    bench.assert_released();
    assert_eq!(bench.camera.close_count(), 1);
    assert_eq!(
        bench.camera.node_value("TLParamsLocked"),
        Some(NodeValue::Int(0))
    );
}

#[tokio::test]
async fn test_panic_mid_loop_releases_devices() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(MockStage::new(SERIAL).with_panic_at_move(3), MockCamera::new());
    let config = fast_config(dir.path());
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let outcome = AssertUnwindSafe(orchestrator.run(&plan)).catch_unwind().await;

    assert!(outcome.is_err());
    assert_eq!(orchestrator.state(), RunState::Closed);
    bench.assert_released();
    assert_eq!(bench.camera.close_count(), 1);
    assert!(!bench.camera.is_acquiring());
    assert_eq!(
        bench.camera.node_value("TLParamsLocked"),
        Some(NodeValue::Int(0))
    );
}

#[tokio::test]
async fn test_overrun_saturates_at_travel_limit() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(MockStage::new(SERIAL), MockCamera::new());
    let mut config = fast_config(dir.path());
    config.scan.initial_position_mm = 24.0;
    config.scan.step_size_mm = 0.5;
    config.scan.step_count = 4;
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.frames.len(), 4);
    assert_eq!(report.final_position_mm, Some(25.0));
    let targets: Vec<f64> = bench.stage.moves().iter().map(|(target, _)| *target).collect();
    assert_eq!(targets, vec![24.0, 24.5, 25.0, 25.0, 25.0]);
}

#[tokio::test]
async fn test_rejected_property_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::new(
        MockStage::new(SERIAL),
        MockCamera::new().with_rejected_property("ReverseX"),
    );
    let mut config = fast_config(dir.path());
    config.scan.step_count = 2;
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].property, "ReverseX");
    assert_eq!(report.frames.len(), 2);
}

#[tokio::test]
async fn test_output_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("run").join("frames");
    let bench = Bench::new(MockStage::new(SERIAL), MockCamera::new());
    let mut config = fast_config(&output);
    config.scan.step_count = 1;
    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(bench.rig(), config);

    let report = orchestrator.run(&plan).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert!(output.is_dir());
    let image = image::open(&report.frames[0].output_path).unwrap();
    assert_eq!((image.width(), image.height()), (64, 48));
}
