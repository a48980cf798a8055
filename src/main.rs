//! stepscan - step the stage, trigger the camera, save a frame, repeat.
//!
//! Usage:
//! ```text
//! stepscan [--config config/stepscan.toml] [--steps 31] [--step-size 0.0008]
//!          [--initial-position 0.0] [--output frames] [--no-home] [--log-level info]
//! ```
//!
//! The bundled binary drives the simulated rig. Log verbosity comes from
//! `RUST_LOG` when set, otherwise from `application.log_level`.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepscan::config::ScanConfig;
use stepscan::data::PngCodec;
use stepscan::hardware::mock::{MockCamera, MockCameraSystem, MockStage, MockStageManager};
use stepscan::{ExperimentOrchestrator, Rig, ScanError};

/// Simulated stage travel speed.
const SIMULATED_SPEED_MM_PER_SEC: f64 = 2.5;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "stepscan",
    about = "Step a linear stage and capture one triggered frame per step",
    long_about = None
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "config/stepscan.toml")]
    config: PathBuf,

    /// Number of move+capture iterations
    #[arg(short = 'n', long)]
    steps: Option<u32>,

    /// Relative move per iteration in millimeters
    #[arg(long)]
    step_size: Option<f64>,

    /// Absolute start position in millimeters
    #[arg(long)]
    initial_position: Option<f64>,

    /// Directory PNG frames are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip homing the stage
    #[arg(long)]
    no_home: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut ScanConfig) {
        if let Some(steps) = self.steps {
            config.scan.step_count = steps;
        }
        if let Some(step_size) = self.step_size {
            config.scan.step_size_mm = step_size;
        }
        if let Some(position) = self.initial_position {
            config.scan.initial_position_mm = position;
        }
        if let Some(output) = &self.output {
            config.output.directory = output.clone();
        }
        if self.no_home {
            config.stage.home = false;
        }
        if let Some(level) = &self.log_level {
            config.application.log_level = level.clone();
        }
    }
}

fn simulated_rig(config: &ScanConfig) -> Rig {
    let stage = MockStage::new(&config.stage.serial).with_speed(SIMULATED_SPEED_MM_PER_SEC);
    Rig {
        stages: Arc::new(MockStageManager::new(stage)),
        cameras: Arc::new(MockCameraSystem::new(MockCamera::new())),
        codec: Arc::new(PngCodec::new()),
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut config = match ScanConfig::load_from(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ScanError::from(e).exit_code());
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return Ok(ScanError::from(e).exit_code());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        app = %config.application.name,
        config = %args.config.display(),
        output = %config.output.directory.display(),
        "Starting scan"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;

    let plan = config.plan();
    let mut orchestrator = ExperimentOrchestrator::new(simulated_rig(&config), config);
    let report = runtime.block_on(orchestrator.run(&plan));

    for warning in &report.warnings {
        warn!(%warning, "Configuration warning");
    }
    info!(
        frames = report.frames.len(),
        final_position_mm = ?report.final_position_mm,
        exit_code = report.exit_code(),
        "Scan finished"
    );
    Ok(report.exit_code())
}

fn main() {
    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            -7
        }
    };
    std::process::exit(code);
}
