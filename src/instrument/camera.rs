//! Software-Triggered Area-Scan Camera
//!
//! The camera is driven through two session types:
//!
//! - [`CameraSession`] - opened and idle. Properties can be written and the
//!   acquisition configuration applied.
//! - [`StreamingSession`] - returned by [`CameraSession::start_stream`].
//!   Parameters are locked on the device (`TLParamsLocked`), so this type
//!   offers read-only queries and [`StreamingSession::capture_one`], and no
//!   way to write a property.
//!
//! Both consume themselves on `close`, so a session is closed at most once.
//!
//! # Example
//!
//! ```rust,ignore
//! let library = CameraLibrary::initialize(system)?;
//! let mut camera = CameraSession::open(library.system()).await?;
//! let warnings = camera.apply_default_config(config.acquisition()).await;
//! let mut streaming = camera.start_stream(FrameBufferPool::new()).await?;
//! let record = streaming.capture_one(&PngCodec, Path::new("frames"), 0).await?;
//! streaming.close().await?;
//! ```

use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::frame_pool::FrameBufferPool;
use super::nodes::{
    self, BoundNodes, PropertyRegistry, ACQUISITION_START, ACQUISITION_STOP, GAIN_ANALOG_ALL,
    TL_PARAMS_LOCKED,
};
use crate::error::{ConfigurationWarning, DeviceKind, ScanError, ScanResult, StreamStep};
use crate::experiment::FrameRecord;
use crate::hardware::capabilities::{
    AccessMode, CameraDevice, CameraSystem, DataStream, ImageCodec, NodeRange,
};

pub use crate::data::OutputFormat;

/// Timestamp layout of frame file names.
pub const FILENAME_TIME_FORMAT: &str = "%d-%m-%Y_%H-%M-%S";

/// Binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binning {
    /// Horizontal factor.
    pub horizontal: i64,
    /// Vertical factor.
    pub vertical: i64,
}

/// Trigger selector, source and mode entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSettings {
    /// `TriggerSelector` entry.
    pub selector: String,
    /// `TriggerSource` entry.
    pub source: String,
    /// `TriggerMode` entry.
    pub mode: String,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            selector: "ReadOutStart".to_string(),
            source: "Software".to_string(),
            mode: "On".to_string(),
        }
    }
}

/// Acquisition settings captured once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    /// Mirror horizontally.
    pub reverse_x: bool,
    /// Mirror vertically.
    pub reverse_y: bool,
    /// Binning factors.
    pub binning: Binning,
    /// Sensor pixel format entry.
    pub pixel_format: String,
    /// Exposure in microseconds; `None` keeps the device value.
    pub exposure_us: Option<f64>,
    /// Analog gain; `None` keeps the device value.
    pub gain: Option<f64>,
    /// ADC gain correction flag.
    pub adc_gain_correction: bool,
    /// Frame rate in Hz; `None` keeps the device value.
    pub frame_rate: Option<f64>,
    /// Software trigger configuration.
    pub trigger: TriggerSettings,
    /// Format frames are converted to before writing.
    pub output_format: OutputFormat,
    /// Bound on each filled-buffer wait.
    pub buffer_timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            reverse_x: false,
            reverse_y: false,
            binning: Binning {
                horizontal: 1,
                vertical: 1,
            },
            pixel_format: "Mono12g24IDS".to_string(),
            exposure_us: None,
            gain: None,
            adc_gain_correction: true,
            frame_rate: None,
            trigger: TriggerSettings::default(),
            output_format: OutputFormat::Mono12,
            buffer_timeout: Duration::from_millis(2000),
        }
    }
}

/// Exposure limits in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRange {
    /// Shortest exposure.
    pub min_us: f64,
    /// Longest exposure.
    pub max_us: f64,
    /// Step between settable values, when constant.
    pub increment_us: Option<f64>,
}

impl From<NodeRange> for ExposureRange {
    fn from(range: NodeRange) -> Self {
        Self {
            min_us: range.min,
            max_us: range.max,
            increment_us: range.increment,
        }
    }
}

fn rejected(property: &'static str, error: anyhow::Error) -> ConfigurationWarning {
    warn!(property, error = %error, "Camera property not applied");
    ConfigurationWarning {
        property,
        reason: error.to_string(),
    }
}

fn logged<T>(property: &'static str, result: anyhow::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(property, error = %e, "Camera query failed");
            None
        }
    }
}

/// Read-only camera queries shared by both session types.
#[derive(Clone, Copy)]
pub struct CameraQuery<'a> {
    nodes: BoundNodes<'a>,
}

impl CameraQuery<'_> {
    /// Current exposure in microseconds.
    pub async fn exposure_time(&self) -> Option<f64> {
        logged(nodes::EXPOSURE_TIME.name(), self.nodes.get(nodes::EXPOSURE_TIME).await)
    }

    /// Settable exposure range.
    pub async fn exposure_range(&self) -> Option<ExposureRange> {
        logged(
            nodes::EXPOSURE_TIME.name(),
            self.nodes.range(nodes::EXPOSURE_TIME).await.map(ExposureRange::from),
        )
    }

    /// Current analog gain.
    pub async fn gain(&self) -> Option<f64> {
        let result: anyhow::Result<f64> = async {
            self.nodes
                .select(nodes::GAIN_SELECTOR, GAIN_ANALOG_ALL)
                .await?;
            self.nodes.get(nodes::GAIN).await
        }
        .await;
        logged(nodes::GAIN.name(), result)
    }

    /// Current acquisition frame rate in Hz.
    pub async fn frame_rate(&self) -> Option<f64> {
        logged(
            nodes::ACQUISITION_FRAME_RATE.name(),
            self.nodes.get(nodes::ACQUISITION_FRAME_RATE).await,
        )
    }

    /// Selected sensor pixel format.
    pub async fn pixel_format(&self) -> Option<String> {
        logged(
            nodes::PIXEL_FORMAT.name(),
            self.nodes.entry(nodes::PIXEL_FORMAT).await,
        )
    }

    /// Bytes per frame in the current configuration.
    pub async fn payload_size(&self) -> Option<i64> {
        logged(
            nodes::PAYLOAD_SIZE.name(),
            self.nodes.get(nodes::PAYLOAD_SIZE).await,
        )
    }
}

/// Opened, idle camera.
pub struct CameraSession {
    device: Box<dyn CameraDevice>,
    registry: PropertyRegistry,
    display_name: String,
    config: Option<AcquisitionConfig>,
}

impl CameraSession {
    /// Open the first discovered camera with exclusive control access.
    ///
    /// # Errors
    /// `DeviceNotFound` when no camera is attached, `Connection` when the
    /// device cannot be opened or lacks a node required for triggered capture.
    pub async fn open(system: &dyn CameraSystem) -> ScanResult<Self> {
        let devices = system.devices().await.map_err(|e| {
            warn!(error = %e, "Camera discovery failed");
            ScanError::Connection(format!("camera discovery failed: {e}"))
        })?;

        let Some(first) = devices.first() else {
            warn!("No camera found");
            return Err(ScanError::DeviceNotFound {
                kind: DeviceKind::Camera,
                id: String::new(),
            });
        };
        debug!(count = devices.len(), camera = %first.display_name, "Cameras discovered");

        let device = system.open(0, AccessMode::Control).await.map_err(|e| {
            warn!(camera = %first.display_name, error = %e, "Camera open failed");
            ScanError::Connection(format!("cannot open {}: {e}", first.display_name))
        })?;

        let registry = match PropertyRegistry::validate(device.node_map()) {
            Ok(registry) => registry,
            Err(e) => {
                if let Err(close_err) = device.close().await {
                    warn!(error = %close_err, "Camera close after failed validation failed");
                }
                return Err(e);
            }
        };

        let display_name = device.display_name();
        info!(camera = %display_name, "Camera opened");
        Ok(Self {
            device,
            registry,
            display_name,
            config: None,
        })
    }

    fn nodes(&self) -> BoundNodes<'_> {
        BoundNodes::new(self.device.node_map(), &self.registry)
    }

    /// Read-only queries.
    pub fn query(&self) -> CameraQuery<'_> {
        CameraQuery {
            nodes: self.nodes(),
        }
    }

    /// Model and serial of the opened camera.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The configuration applied to this session, if any.
    pub fn config(&self) -> Option<&AcquisitionConfig> {
        self.config.as_ref()
    }

    /// Apply `config` in device order: axis reversal, binning, pixel format,
    /// exposure, gain, ADC gain correction, frame rate, trigger selector,
    /// source and mode.
    ///
    /// Best effort: every property is attempted and each rejection is
    /// returned as a warning. The configuration is write-once; a second call
    /// changes nothing and returns a single warning.
    pub async fn apply_default_config(
        &mut self,
        config: AcquisitionConfig,
    ) -> Vec<ConfigurationWarning> {
        if self.config.is_some() {
            warn!(camera = %self.display_name, "Acquisition configuration already applied");
            return vec![ConfigurationWarning {
                property: "AcquisitionConfig",
                reason: "already applied to this session".to_string(),
            }];
        }

        let bound = self.nodes();
        let mut warnings = Vec::new();
        let mut check = |property: &'static str, result: anyhow::Result<()>| {
            if let Err(e) = result {
                warnings.push(rejected(property, e));
            }
        };

        check(
            nodes::REVERSE_X.name(),
            bound.set(nodes::REVERSE_X, config.reverse_x).await,
        );
        check(
            nodes::REVERSE_Y.name(),
            bound.set(nodes::REVERSE_Y, config.reverse_y).await,
        );
        check(
            nodes::BINNING_VERTICAL.name(),
            bound
                .set(nodes::BINNING_VERTICAL, config.binning.vertical)
                .await,
        );
        check(
            nodes::BINNING_HORIZONTAL.name(),
            bound
                .set(nodes::BINNING_HORIZONTAL, config.binning.horizontal)
                .await,
        );
        check(
            nodes::PIXEL_FORMAT.name(),
            bound.select(nodes::PIXEL_FORMAT, &config.pixel_format).await,
        );
        if let Some(exposure) = config.exposure_us {
            check(
                nodes::EXPOSURE_TIME.name(),
                bound.set(nodes::EXPOSURE_TIME, exposure).await,
            );
        }
        if let Some(gain) = config.gain {
            check(nodes::GAIN.name(), set_analog(&bound, nodes::GAIN, gain).await);
        }
        check(
            nodes::ADC_GAIN_CORRECTION.name(),
            set_analog(&bound, nodes::ADC_GAIN_CORRECTION, config.adc_gain_correction).await,
        );
        if let Some(rate) = config.frame_rate {
            check(
                nodes::ACQUISITION_FRAME_RATE.name(),
                bound.set(nodes::ACQUISITION_FRAME_RATE, rate).await,
            );
        }
        check(
            nodes::TRIGGER_SELECTOR.name(),
            bound
                .select(nodes::TRIGGER_SELECTOR, &config.trigger.selector)
                .await,
        );
        check(
            nodes::TRIGGER_SOURCE.name(),
            bound
                .select(nodes::TRIGGER_SOURCE, &config.trigger.source)
                .await,
        );
        check(
            nodes::TRIGGER_MODE.name(),
            bound.select(nodes::TRIGGER_MODE, &config.trigger.mode).await,
        );

        info!(
            camera = %self.display_name,
            pixel_format = %config.pixel_format,
            warnings = warnings.len(),
            "Acquisition configuration applied"
        );
        self.config = Some(config);
        warnings
    }

    /// Set the exposure in microseconds.
    pub async fn set_exposure_time(&self, exposure_us: f64) -> Result<(), ConfigurationWarning> {
        self.nodes()
            .set(nodes::EXPOSURE_TIME, exposure_us)
            .await
            .map_err(|e| rejected(nodes::EXPOSURE_TIME.name(), e))
    }

    /// Set the analog gain of all channels.
    pub async fn set_gain(&self, gain: f64) -> Result<(), ConfigurationWarning> {
        set_analog(&self.nodes(), nodes::GAIN, gain)
            .await
            .map_err(|e| rejected(nodes::GAIN.name(), e))
    }

    /// Enable or disable ADC gain correction.
    pub async fn set_adc_gain_correction(&self, enabled: bool) -> Result<(), ConfigurationWarning> {
        set_analog(&self.nodes(), nodes::ADC_GAIN_CORRECTION, enabled)
            .await
            .map_err(|e| rejected(nodes::ADC_GAIN_CORRECTION.name(), e))
    }

    /// Set the acquisition frame rate in Hz.
    pub async fn set_frame_rate(&self, rate_hz: f64) -> Result<(), ConfigurationWarning> {
        self.nodes()
            .set(nodes::ACQUISITION_FRAME_RATE, rate_hz)
            .await
            .map_err(|e| rejected(nodes::ACQUISITION_FRAME_RATE.name(), e))
    }

    /// Open the data stream, prepare `pool`, start the acquisition engine,
    /// lock parameters and run `AcquisitionStart`.
    ///
    /// Uses the applied configuration, or the defaults when none was applied.
    ///
    /// # Errors
    /// `StreamStart` naming the failed step, or `BufferPreparation`. The
    /// session is torn down and the device closed before the error returns.
    pub async fn start_stream(self, pool: FrameBufferPool) -> ScanResult<StreamingSession> {
        let config = self.config.clone().unwrap_or_default();
        let step_error = |step: StreamStep, e: anyhow::Error| {
            warn!(%step, error = %e, "Stream start failed");
            ScanError::StreamStart {
                step,
                reason: e.to_string(),
            }
        };

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                let error = step_error(StreamStep::OpenStream, e);
                self.close().await?;
                return Err(error);
            }
        };

        let mut streaming = StreamingSession {
            device: Some(self.device),
            registry: self.registry,
            display_name: self.display_name,
            config,
            stream,
            pool,
            engine_started: false,
            params_locked: false,
            acquisition_running: false,
        };

        match streaming.start().await {
            Ok(()) => {
                info!(
                    camera = %streaming.display_name,
                    buffers = streaming.pool.len(),
                    "Streaming started"
                );
                Ok(streaming)
            }
            Err(error) => {
                if let Err(close_err) = streaming.close().await {
                    warn!(error = %close_err, "Teardown after failed stream start failed");
                }
                Err(error)
            }
        }
    }

    async fn open_stream(&self) -> anyhow::Result<Box<dyn DataStream>> {
        let count = self.device.data_stream_count().await?;
        if count == 0 {
            anyhow::bail!("device exposes no data streams");
        }
        self.device.open_data_stream().await
    }

    /// Release the device.
    pub async fn close(self) -> ScanResult<()> {
        match self.device.close().await {
            Ok(()) => info!(camera = %self.display_name, "Camera closed"),
            Err(e) => warn!(camera = %self.display_name, error = %e, "Camera close failed"),
        }
        Ok(())
    }
}

/// Select the analog gain channel group, then write `property`.
async fn set_analog<T: nodes::NodeKind>(
    bound: &BoundNodes<'_>,
    property: nodes::Property<T>,
    value: T,
) -> anyhow::Result<()> {
    bound.select(nodes::GAIN_SELECTOR, GAIN_ANALOG_ALL).await?;
    bound.set(property, value).await
}

/// Camera with parameters locked and the acquisition engine running.
pub struct StreamingSession {
    device: Option<Box<dyn CameraDevice>>,
    registry: PropertyRegistry,
    display_name: String,
    config: AcquisitionConfig,
    stream: Box<dyn DataStream>,
    pool: FrameBufferPool,
    engine_started: bool,
    params_locked: bool,
    acquisition_running: bool,
}

impl StreamingSession {
    async fn start(&mut self) -> ScanResult<()> {
        let step_error = |step: StreamStep, e: anyhow::Error| {
            warn!(%step, error = %e, "Stream start failed");
            ScanError::StreamStart {
                step,
                reason: e.to_string(),
            }
        };

        let payload_size = self
            .nodes()?
            .get(nodes::PAYLOAD_SIZE)
            .await
            .map_err(|e| step_error(StreamStep::PrepareBuffers, e))?;
        let payload_size = usize::try_from(payload_size).map_err(|_| {
            ScanError::BufferPreparation(format!("invalid payload size {payload_size}"))
        })?;
        self.pool.prepare(self.stream.as_ref(), payload_size).await?;

        self.stream
            .start_acquisition()
            .await
            .map_err(|e| step_error(StreamStep::StartAcquisition, e))?;
        self.engine_started = true;

        self.nodes()?
            .set(TL_PARAMS_LOCKED, 1)
            .await
            .map_err(|e| step_error(StreamStep::LockParameters, e))?;
        self.params_locked = true;

        self.nodes()?
            .execute_and_wait(ACQUISITION_START)
            .await
            .map_err(|e| step_error(StreamStep::AcquisitionStart, e))?;
        self.acquisition_running = true;
        Ok(())
    }

    fn nodes(&self) -> ScanResult<BoundNodes<'_>> {
        let device = self
            .device
            .as_deref()
            .ok_or_else(|| ScanError::Connection(format!("camera {} is closed", self.display_name)))?;
        Ok(BoundNodes::new(device.node_map(), &self.registry))
    }

    /// Read-only queries.
    pub fn query(&self) -> ScanResult<CameraQuery<'_>> {
        Ok(CameraQuery {
            nodes: self.nodes()?,
        })
    }

    /// Configuration the stream was started with.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Model and serial of the camera.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Buffers currently in rotation.
    pub fn pool(&self) -> &FrameBufferPool {
        &self.pool
    }

    /// Trigger one exposure and write it to `output_dir` as
    /// `<DD-MM-YYYY_HH-MM-SS>.png`; a name already taken gets
    /// `_<sequence_index>` appended.
    ///
    /// The filled buffer is re-queued whether or not conversion succeeds.
    /// A refused requeue is reported only after the frame has been written.
    ///
    /// # Errors
    /// `CaptureTimeout` when no frame arrives, `Capture` for trigger,
    /// conversion or requeue failures, `FrameWrite` when the file cannot be
    /// written. None of them invalidate the session.
    pub async fn capture_one(
        &mut self,
        codec: &dyn ImageCodec,
        output_dir: &Path,
        sequence_index: usize,
    ) -> ScanResult<FrameRecord> {
        self.nodes()?
            .execute(nodes::TRIGGER_SOFTWARE)
            .await
            .map_err(|e| {
                warn!(sequence_index, error = %e, "Software trigger failed");
                ScanError::Capture(format!("software trigger failed: {e}"))
            })?;

        let timeout = self.config.buffer_timeout;
        let buffer = match self.pool.wait_for_filled(self.stream.as_ref(), timeout).await {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(sequence_index, error = %e, "No frame for trigger");
                return Err(e);
            }
        };
        let timestamp = Local::now();
        debug!(sequence_index, frame_id = buffer.frame_id, "Frame received");

        let converted = codec
            .buffer_to_image(&buffer)
            .and_then(|frame| codec.convert_to(&frame, self.config.output_format));
        let requeued = self.pool.requeue(self.stream.as_ref(), buffer.id).await;

        let frame = converted.map_err(|e| {
            warn!(sequence_index, error = %e, "Frame conversion failed");
            ScanError::Capture(format!("conversion failed: {e}"))
        })?;

        // a refused requeue is reported after the write
        let stamp = timestamp.format(FILENAME_TIME_FORMAT).to_string();
        let output_path =
            frame_path(output_dir, &stamp, sequence_index).map_err(|e| ScanError::FrameWrite {
                path: output_dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        if let Err(e) = codec.write_image(&output_path, &frame) {
            warn!(path = %output_path.display(), error = %e, "Frame write failed");
            let _ = std::fs::remove_file(&output_path);
            return Err(ScanError::FrameWrite {
                path: output_path,
                reason: e.to_string(),
            });
        }
        if let Err(e) = requeued {
            warn!(sequence_index, path = %output_path.display(), "Frame saved but its buffer was lost");
            return Err(e);
        }

        info!(sequence_index, path = %output_path.display(), "Frame saved");
        Ok(FrameRecord {
            timestamp,
            sequence_index,
            output_path,
        })
    }

    /// Stop acquisition, unlock parameters, revoke buffers and release the
    /// device. Teardown failures are logged, never returned.
    pub async fn close(mut self) -> ScanResult<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let nodes = BoundNodes::new(device.node_map(), &self.registry);

        if self.acquisition_running {
            if let Err(e) = nodes.execute_and_wait(ACQUISITION_STOP).await {
                warn!(error = %e, "AcquisitionStop failed");
            }
            self.acquisition_running = false;
        }
        if self.engine_started {
            if let Err(e) = self.stream.stop_acquisition().await {
                warn!(error = %e, "Stopping acquisition engine failed");
            }
            self.engine_started = false;
        }
        if let Err(e) = self.pool.release(self.stream.as_ref()).await {
            warn!(error = %e, "Buffer release failed");
        }
        if self.params_locked {
            if let Err(e) = nodes.set(TL_PARAMS_LOCKED, 0).await {
                warn!(error = %e, "Unlocking parameters failed");
            }
            self.params_locked = false;
        }

        match device.close().await {
            Ok(()) => info!(camera = %self.display_name, "Camera closed"),
            Err(e) => warn!(camera = %self.display_name, error = %e, "Camera close failed"),
        }
        Ok(())
    }
}

/// Reserve `<dir>/<stamp>.png`, falling back to `<stamp>_<index>.png` and
/// then `<stamp>_<index>_<n>.png` until a name is free. The returned path
/// exists as an empty file; creating it with `create_new` means no earlier
/// frame is ever overwritten. Creates `dir` when absent.
fn frame_path(dir: &Path, stamp: &str, sequence_index: usize) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let candidates = [format!("{stamp}.png"), format!("{stamp}_{sequence_index}.png")]
        .into_iter()
        .chain((1..).map(|n| format!("{stamp}_{sequence_index}_{n}.png")));
    for name in candidates {
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {stamp}"),
    ))
}
