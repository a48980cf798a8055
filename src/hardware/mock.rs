//! Simulated Rig
//!
//! Simulated implementations of every capability trait, used by the tests
//! and by the bundled binary. All mocks are cheap to clone; clones share
//! state, so a test keeps one handle for inspection while the code under
//! test owns another.
//!
//! # Available Mocks
//!
//! - `MockStageManager` / `MockStage` - single servo stage with fault injection
//! - `MockCameraSystem` - camera SDK library with zero or more cameras
//! - `MockCamera` - camera device and node map with a realistic node set
//! - `MockDataStream` - announced/queued/filled buffer bookkeeping
//!
//! # Fault Injection
//!
//! Missing devices, settings that never initialize, homing failure, a
//! failing or panicking k-th move, rejected or missing properties,
//! acquisition start failure, a lost k-th frame (buffer wait timeout),
//! buffer allocation failure and refused requeues.
//!
//! Waits use `tokio::time::sleep`; no mock blocks the runtime thread.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::data::RawPixelFormat;
use crate::hardware::capabilities::{
    AccessMode, BufferId, CameraDevice, CameraSystem, DataStream, DeviceDescriptor, FilledBuffer,
    FlushMode, MotionDevice, NodeMap, NodeRange, NodeValue, StageManager,
};

/// Lock a mutex, recovering the data if a panicking test poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockStage - Simulated Servo Stage
// =============================================================================

#[derive(Debug)]
struct StageInner {
    serial: String,
    position: f64,
    speed_mm_per_sec: Option<f64>,
    connected: bool,
    polling: Option<Duration>,
    enabled: bool,
    settings_initialized: bool,
    settings_never_initialize: bool,
    profile: Option<String>,
    homing_fails: bool,
    connect_fails: bool,
    move_count: usize,
    move_failure_at: Option<usize>,
    panic_at_move: Option<usize>,
    moves: Vec<(f64, Duration)>,
    position_query_fails: bool,
    disconnect_count: usize,
}

/// Simulated single-axis servo controller.
///
/// Moves complete instantly unless a speed is set with [`MockStage::with_speed`].
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new("27601295").with_position(3.0);
/// let manager = MockStageManager::new(stage.clone());
/// // ... run code against `manager`, then inspect `stage`
/// assert_eq!(stage.disconnect_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MockStage {
    inner: Arc<Mutex<StageInner>>,
}

impl MockStage {
    /// Stage with the given serial, parked at 0 mm.
    pub fn new(serial: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StageInner {
                serial: serial.to_string(),
                position: 0.0,
                speed_mm_per_sec: None,
                connected: false,
                polling: None,
                enabled: false,
                settings_initialized: false,
                settings_never_initialize: false,
                profile: None,
                homing_fails: false,
                connect_fails: false,
                move_count: 0,
                move_failure_at: None,
                panic_at_move: None,
                moves: Vec::new(),
                position_query_fails: false,
                disconnect_count: 0,
            })),
        }
    }

    /// Start at `position_mm`.
    pub fn with_position(self, position_mm: f64) -> Self {
        lock(&self.inner).position = position_mm;
        self
    }

    /// Simulate travel time at `speed_mm_per_sec`.
    pub fn with_speed(self, speed_mm_per_sec: f64) -> Self {
        lock(&self.inner).speed_mm_per_sec = Some(speed_mm_per_sec);
        self
    }

    /// Settings never report as initialized.
    pub fn with_settings_never_initialized(self) -> Self {
        lock(&self.inner).settings_never_initialize = true;
        self
    }

    /// Homing always fails.
    pub fn with_homing_failure(self) -> Self {
        lock(&self.inner).homing_fails = true;
        self
    }

    /// Connecting always fails.
    pub fn with_connect_failure(self) -> Self {
        lock(&self.inner).connect_fails = true;
        self
    }

    /// The `n`-th move (1-based) fails.
    pub fn with_move_failure_at(self, n: usize) -> Self {
        lock(&self.inner).move_failure_at = Some(n);
        self
    }

    /// The `n`-th move (1-based) panics.
    pub fn with_panic_at_move(self, n: usize) -> Self {
        lock(&self.inner).panic_at_move = Some(n);
        self
    }

    /// Make position queries fail.
    pub fn set_position_query_failure(&self, fail: bool) {
        lock(&self.inner).position_query_fails = fail;
    }

    /// Serial number.
    pub fn serial(&self) -> String {
        lock(&self.inner).serial.clone()
    }

    /// Whether the stage is connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    /// Whether position polling is running.
    pub fn is_polling(&self) -> bool {
        lock(&self.inner).polling.is_some()
    }

    /// Whether the actuator is enabled.
    pub fn is_enabled(&self) -> bool {
        lock(&self.inner).enabled
    }

    /// Applied motion profile.
    pub fn profile(&self) -> Option<String> {
        lock(&self.inner).profile.clone()
    }

    /// Current simulated position.
    pub fn position(&self) -> f64 {
        lock(&self.inner).position
    }

    /// Every completed move as `(target, timeout)`.
    pub fn moves(&self) -> Vec<(f64, Duration)> {
        lock(&self.inner).moves.clone()
    }

    /// Number of disconnect calls.
    pub fn disconnect_count(&self) -> usize {
        lock(&self.inner).disconnect_count
    }

    fn require_connected(&self) -> Result<()> {
        if lock(&self.inner).connected {
            Ok(())
        } else {
            bail!("stage not connected")
        }
    }
}

#[async_trait]
impl MotionDevice for MockStage {
    async fn connect(&self, serial: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.connect_fails {
            bail!("simulated connection failure");
        }
        if inner.serial != serial {
            bail!("no device with serial {}", serial);
        }
        inner.connected = true;
        inner.settings_initialized = !inner.settings_never_initialize;
        Ok(())
    }

    async fn start_polling(&self, interval: Duration) -> Result<()> {
        self.require_connected()?;
        lock(&self.inner).polling = Some(interval);
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.require_connected()?;
        lock(&self.inner).enabled = true;
        Ok(())
    }

    async fn description(&self) -> Result<String> {
        Ok(format!("Simulated servo controller {}", lock(&self.inner).serial))
    }

    async fn is_settings_initialized(&self) -> Result<bool> {
        Ok(lock(&self.inner).settings_initialized)
    }

    async fn wait_for_settings_initialized(&self, timeout: Duration) -> Result<()> {
        if lock(&self.inner).settings_initialized {
            return Ok(());
        }
        sleep(timeout).await;
        bail!("settings not initialized after {:?}", timeout)
    }

    async fn load_configuration(&self, serial: &str, profile: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.serial != serial {
            bail!("no configuration for serial {}", serial);
        }
        inner.profile = Some(profile.to_string());
        Ok(())
    }

    async fn home(&self, _timeout: Duration) -> Result<()> {
        self.require_connected()?;
        let mut inner = lock(&self.inner);
        if inner.homing_fails {
            bail!("limit switch not found");
        }
        inner.position = 0.0;
        Ok(())
    }

    async fn move_to(&self, position_mm: f64, timeout: Duration) -> Result<()> {
        self.require_connected()?;
        let (count, travel) = {
            let mut inner = lock(&self.inner);
            inner.move_count += 1;
            let travel = inner
                .speed_mm_per_sec
                .map(|speed| Duration::from_secs_f64((position_mm - inner.position).abs() / speed));
            (inner.move_count, travel)
        };

        #[allow(clippy::panic)]
        if lock(&self.inner).panic_at_move == Some(count) {
            panic!("simulated stage fault on move {count}");
        }
        if lock(&self.inner).move_failure_at == Some(count) {
            bail!("move {} to {} mm did not complete", count, position_mm);
        }

        if let Some(travel) = travel {
            sleep(travel.min(timeout)).await;
        }

        let mut inner = lock(&self.inner);
        inner.position = position_mm;
        inner.moves.push((position_mm, timeout));
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        let inner = lock(&self.inner);
        if inner.position_query_fails {
            bail!("status request timed out");
        }
        Ok(inner.position)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.disconnect_count += 1;
        inner.connected = false;
        inner.polling = None;
        inner.enabled = false;
        Ok(())
    }
}

/// Simulated stage discovery.
#[derive(Debug, Clone, Default)]
pub struct MockStageManager {
    stages: Vec<MockStage>,
}

impl MockStageManager {
    /// Manager with one attached stage.
    pub fn new(stage: MockStage) -> Self {
        Self {
            stages: vec![stage],
        }
    }

    /// Manager with nothing attached.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageManager for MockStageManager {
    async fn device_list(&self) -> Result<Vec<String>> {
        Ok(self.stages.iter().map(MockStage::serial).collect())
    }

    async fn create(&self, serial: &str) -> Result<Box<dyn MotionDevice>> {
        let stage = self
            .stages
            .iter()
            .find(|s| s.serial() == serial)
            .ok_or_else(|| anyhow!("no device with serial {}", serial))?;
        Ok(Box::new(stage.clone()))
    }
}

// =============================================================================
// MockDataStream - Simulated Frame Transport
// =============================================================================

#[derive(Debug)]
struct StreamInner {
    min_required: usize,
    next_id: u64,
    announced: BTreeMap<BufferId, usize>,
    input: VecDeque<BufferId>,
    output: VecDeque<FilledBuffer>,
    acquiring: bool,
    fail_alloc: bool,
    fail_start: bool,
    fail_queue: bool,
    revoke_count: usize,
    frame_counter: u64,
}

/// Simulated data stream.
///
/// Buffers move from the input queue to the output queue when a frame is
/// delivered with [`MockDataStream::fill_next`]. A delivery with no queued
/// buffer, or while acquisition is stopped, is dropped like on real hardware.
#[derive(Debug, Clone)]
pub struct MockDataStream {
    inner: Arc<Mutex<StreamInner>>,
}

impl MockDataStream {
    /// Stream whose driver requires `min_required` buffers.
    pub fn new(min_required: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                min_required,
                next_id: 1,
                announced: BTreeMap::new(),
                input: VecDeque::new(),
                output: VecDeque::new(),
                acquiring: false,
                fail_alloc: false,
                fail_start: false,
                fail_queue: false,
                revoke_count: 0,
                frame_counter: 0,
            })),
        }
    }

    /// Buffer allocation always fails.
    pub fn with_allocation_failure(self) -> Self {
        lock(&self.inner).fail_alloc = true;
        self
    }

    /// Starting the acquisition engine fails.
    pub fn with_start_failure(self) -> Self {
        lock(&self.inner).fail_start = true;
        self
    }

    /// Make `queue_buffer` fail.
    pub fn set_queue_failure(&self, fail: bool) {
        lock(&self.inner).fail_queue = fail;
    }

    /// Announce a buffer behind the pool's back.
    pub fn announce_foreign_buffer(&self, size: usize) -> BufferId {
        let mut inner = lock(&self.inner);
        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        inner.announced.insert(id, size);
        id
    }

    /// Fill the oldest queued buffer with a frame. Returns whether a buffer
    /// was available.
    pub fn fill_next(&self, width: u32, height: u32, pixel_format: &str, payload: Vec<u8>) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.acquiring {
            return false;
        }
        let Some(id) = inner.input.pop_front() else {
            return false;
        };
        let capacity = inner.announced.get(&id).copied().unwrap_or(0);
        let mut payload = payload;
        payload.truncate(capacity);
        let frame_id = inner.frame_counter;
        inner.frame_counter += 1;
        inner.output.push_back(FilledBuffer {
            id,
            width,
            height,
            pixel_format: pixel_format.to_string(),
            frame_id,
            payload,
        });
        true
    }

    /// Number of announced buffers.
    pub fn announced_count(&self) -> usize {
        lock(&self.inner).announced.len()
    }

    /// Number of buffers waiting in the input queue.
    pub fn queued_count(&self) -> usize {
        lock(&self.inner).input.len()
    }

    /// Number of revoked buffers.
    pub fn revoke_count(&self) -> usize {
        lock(&self.inner).revoke_count
    }

    /// Whether the acquisition engine is running.
    pub fn is_acquiring(&self) -> bool {
        lock(&self.inner).acquiring
    }
}

#[async_trait]
impl DataStream for MockDataStream {
    async fn flush(&self, mode: FlushMode) -> Result<()> {
        let mut inner = lock(&self.inner);
        match mode {
            FlushMode::DiscardAll => {
                inner.input.clear();
                inner.output.clear();
            }
        }
        Ok(())
    }

    async fn announced_buffers(&self) -> Result<Vec<BufferId>> {
        Ok(lock(&self.inner).announced.keys().copied().collect())
    }

    async fn revoke_buffer(&self, id: BufferId) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.announced.remove(&id).is_none() {
            bail!("buffer {} is not announced", id.0);
        }
        inner.input.retain(|b| *b != id);
        inner.revoke_count += 1;
        Ok(())
    }

    async fn min_required_buffers(&self) -> Result<usize> {
        Ok(lock(&self.inner).min_required)
    }

    async fn alloc_and_announce_buffer(&self, size: usize) -> Result<BufferId> {
        let mut inner = lock(&self.inner);
        if inner.fail_alloc {
            bail!("out of memory allocating {} bytes", size);
        }
        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        inner.announced.insert(id, size);
        Ok(id)
    }

    async fn queue_buffer(&self, id: BufferId) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail_queue {
            bail!("driver refused buffer {}", id.0);
        }
        if !inner.announced.contains_key(&id) {
            bail!("buffer {} is not announced", id.0);
        }
        if inner.input.contains(&id) {
            bail!("buffer {} is already queued", id.0);
        }
        inner.input.push_back(id);
        Ok(())
    }

    async fn wait_for_finished_buffer(&self, timeout: Duration) -> Result<Option<FilledBuffer>> {
        if let Some(buffer) = lock(&self.inner).output.pop_front() {
            return Ok(Some(buffer));
        }
        sleep(timeout).await;
        Ok(lock(&self.inner).output.pop_front())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail_start {
            bail!("acquisition engine failed to start");
        }
        inner.acquiring = true;
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        lock(&self.inner).acquiring = false;
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Camera Device and Node Map
// =============================================================================

#[derive(Debug, Clone)]
struct MockNode {
    /// `None` for command nodes.
    value: Option<NodeValue>,
    range: Option<NodeRange>,
    entries: Vec<String>,
    /// Rejects writes while `TLParamsLocked` is set.
    locked_while_streaming: bool,
}

impl MockNode {
    fn value(value: NodeValue) -> Self {
        Self {
            value: Some(value),
            range: None,
            entries: Vec::new(),
            locked_while_streaming: false,
        }
    }

    fn numeric(value: NodeValue, min: f64, max: f64, increment: Option<f64>) -> Self {
        Self {
            range: Some(NodeRange { min, max, increment }),
            ..Self::value(value)
        }
    }

    fn enumeration(current: &str, entries: &[&str]) -> Self {
        Self {
            entries: entries.iter().map(|e| e.to_string()).collect(),
            ..Self::value(NodeValue::Enum(current.to_string()))
        }
    }

    fn command() -> Self {
        Self {
            value: None,
            range: None,
            entries: Vec::new(),
            locked_while_streaming: false,
        }
    }

    fn locked(mut self) -> Self {
        self.locked_while_streaming = true;
        self
    }
}

fn default_nodes(width: u32, height: u32) -> BTreeMap<String, MockNode> {
    let mut nodes = BTreeMap::new();
    let mut add = |name: &str, node: MockNode| {
        nodes.insert(name.to_string(), node);
    };

    add("ReverseX", MockNode::value(NodeValue::Bool(false)).locked());
    add("ReverseY", MockNode::value(NodeValue::Bool(false)).locked());
    add(
        "BinningHorizontal",
        MockNode::numeric(NodeValue::Int(1), 1.0, 4.0, Some(1.0)).locked(),
    );
    add(
        "BinningVertical",
        MockNode::numeric(NodeValue::Int(1), 1.0, 4.0, Some(1.0)).locked(),
    );
    add(
        "Width",
        MockNode::numeric(NodeValue::Int(i64::from(width)), 8.0, f64::from(width), Some(8.0)).locked(),
    );
    add(
        "Height",
        MockNode::numeric(NodeValue::Int(i64::from(height)), 2.0, f64::from(height), Some(2.0))
            .locked(),
    );
    add(
        "PixelFormat",
        MockNode::enumeration(
            "Mono8",
            &["Mono8", "Mono10", "Mono12", "Mono16", "Mono10g40IDS", "Mono12g24IDS"],
        )
        .locked(),
    );
    add(
        "ExposureTime",
        MockNode::numeric(NodeValue::Float(10_000.0), 28.0, 2_000_000.0, Some(1.0)),
    );
    add("GainSelector", MockNode::enumeration("AnalogAll", &["AnalogAll", "DigitalAll"]));
    add("Gain", MockNode::numeric(NodeValue::Float(1.0), 1.0, 16.0, None));
    add("ADCGainCorrection", MockNode::value(NodeValue::Bool(false)));
    add(
        "AcquisitionFrameRate",
        MockNode::numeric(NodeValue::Float(25.0), 1.0, 60.0, None),
    );
    add(
        "TriggerSelector",
        MockNode::enumeration("ExposureStart", &["ExposureStart", "ReadOutStart"]).locked(),
    );
    add(
        "TriggerSource",
        MockNode::enumeration("Line0", &["Line0", "Software"]).locked(),
    );
    add("TriggerMode", MockNode::enumeration("Off", &["Off", "On"]).locked());
    add("PayloadSize", MockNode::value(NodeValue::Int(0)));
    add("TLParamsLocked", MockNode::numeric(NodeValue::Int(0), 0.0, 1.0, Some(1.0)));
    add("AcquisitionStart", MockNode::command());
    add("AcquisitionStop", MockNode::command());
    add("TriggerSoftware", MockNode::command());
    nodes
}

#[derive(Debug)]
struct CameraInner {
    model: String,
    serial: String,
    sensor_width: u32,
    sensor_height: u32,
    nodes: BTreeMap<String, MockNode>,
    rejected: HashSet<String>,
    writes: Vec<(String, NodeValue)>,
    executed: Vec<String>,
    acquiring: bool,
    fail_acquisition_start: bool,
    data_streams: usize,
    fail_stream_open: bool,
    close_count: usize,
    last_access: Option<AccessMode>,
    trigger_count: usize,
    lost_triggers: HashSet<usize>,
}

impl CameraInner {
    fn int(&self, name: &str) -> i64 {
        match self.nodes.get(name).and_then(|n| n.value.clone()) {
            Some(NodeValue::Int(v)) => v,
            _ => 0,
        }
    }

    fn pixel_format(&self) -> String {
        match self.nodes.get("PixelFormat").and_then(|n| n.value.clone()) {
            Some(NodeValue::Enum(entry)) => entry,
            _ => "Mono8".to_string(),
        }
    }

    fn params_locked(&self) -> bool {
        self.int("TLParamsLocked") != 0
    }

    fn payload_size(&self) -> Result<i64> {
        let format = RawPixelFormat::from_name(&self.pixel_format())?;
        let pixels = (self.int("Width") * self.int("Height")).max(0) as usize;
        Ok(format.payload_len(pixels) as i64)
    }

    fn check_writable(&self, name: &str) -> Result<&MockNode> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| anyhow!("node '{}' not found", name))?;
        if self.rejected.contains(name) {
            bail!("access to '{}' denied", name);
        }
        if node.value.is_none() {
            bail!("'{}' is a command node", name);
        }
        if node.locked_while_streaming && self.params_locked() {
            bail!("'{}' is locked while TLParamsLocked is set", name);
        }
        Ok(node)
    }

    fn apply_binning(&mut self) {
        let horizontal = self.int("BinningHorizontal").max(1);
        let vertical = self.int("BinningVertical").max(1);
        let width = i64::from(self.sensor_width) / horizontal;
        let height = i64::from(self.sensor_height) / vertical;
        if let Some(node) = self.nodes.get_mut("Width") {
            node.value = Some(NodeValue::Int(width));
        }
        if let Some(node) = self.nodes.get_mut("Height") {
            node.value = Some(NodeValue::Int(height));
        }
    }

    /// Synthetic gradient frame for the current geometry and pixel format.
    fn render_frame(&self) -> Result<(u32, u32, String, Vec<u8>)> {
        let format = RawPixelFormat::from_name(&self.pixel_format())?;
        let width = self.int("Width").max(0) as u32;
        let height = self.int("Height").max(0) as u32;
        let max = (1u32 << format.bit_depth()) - 1;
        let offset = self.trigger_count as u32;
        let values: Vec<u16> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (((x + y + offset) * 16) & max) as u16))
            .collect();
        Ok((width, height, format.name().to_string(), format.pack(&values)))
    }
}

/// Simulated monochrome camera with an IDS-style node set.
///
/// Implements both [`CameraDevice`] and [`NodeMap`]; writes to geometry,
/// pixel format and trigger nodes are refused once `TLParamsLocked` is set.
/// `TriggerSoftware` renders a gradient frame into the next queued buffer of
/// the camera's [`MockDataStream`].
#[derive(Debug, Clone)]
pub struct MockCamera {
    inner: Arc<Mutex<CameraInner>>,
    stream: MockDataStream,
}

impl MockCamera {
    /// 64 x 48 sensor, three required stream buffers.
    pub fn new() -> Self {
        Self::with_sensor(64, 48)
    }

    /// Camera with the given sensor size.
    pub fn with_sensor(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CameraInner {
                model: "Simulated mono camera".to_string(),
                serial: "4104000001".to_string(),
                sensor_width: width,
                sensor_height: height,
                nodes: default_nodes(width, height),
                rejected: HashSet::new(),
                writes: Vec::new(),
                executed: Vec::new(),
                acquiring: false,
                fail_acquisition_start: false,
                data_streams: 1,
                fail_stream_open: false,
                close_count: 0,
                last_access: None,
                trigger_count: 0,
                lost_triggers: HashSet::new(),
            })),
            stream: MockDataStream::new(3),
        }
    }

    /// Replace the data stream.
    pub fn with_stream(mut self, stream: MockDataStream) -> Self {
        self.stream = stream;
        self
    }

    /// Writes to `name` fail.
    pub fn with_rejected_property(self, name: &str) -> Self {
        lock(&self.inner).rejected.insert(name.to_string());
        self
    }

    /// Remove `name` from the node map.
    pub fn without_node(self, name: &str) -> Self {
        lock(&self.inner).nodes.remove(name);
        self
    }

    /// `AcquisitionStart` fails.
    pub fn with_acquisition_start_failure(self) -> Self {
        lock(&self.inner).fail_acquisition_start = true;
        self
    }

    /// Report `count` data streams.
    pub fn with_data_stream_count(self, count: usize) -> Self {
        lock(&self.inner).data_streams = count;
        self
    }

    /// Opening the data stream fails.
    pub fn with_stream_open_failure(self) -> Self {
        lock(&self.inner).fail_stream_open = true;
        self
    }

    /// The `n`-th software trigger (1-based) produces no frame.
    pub fn with_lost_frame_at(self, n: usize) -> Self {
        lock(&self.inner).lost_triggers.insert(n);
        self
    }

    /// Shared handle to the camera's data stream.
    pub fn stream(&self) -> MockDataStream {
        self.stream.clone()
    }

    /// Current value of a node.
    pub fn node_value(&self, name: &str) -> Option<NodeValue> {
        lock(&self.inner).nodes.get(name).and_then(|n| n.value.clone())
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(String, NodeValue)> {
        lock(&self.inner).writes.clone()
    }

    /// Every executed command, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.inner).executed.clone()
    }

    /// Number of close calls.
    pub fn close_count(&self) -> usize {
        lock(&self.inner).close_count
    }

    /// Whether `AcquisitionStart` ran without a matching stop.
    pub fn is_acquiring(&self) -> bool {
        lock(&self.inner).acquiring
    }

    /// Access mode of the last open.
    pub fn last_access(&self) -> Option<AccessMode> {
        lock(&self.inner).last_access
    }

    /// Number of software triggers received while acquiring.
    pub fn trigger_count(&self) -> usize {
        lock(&self.inner).trigger_count
    }

    fn descriptor(&self) -> DeviceDescriptor {
        let inner = lock(&self.inner);
        DeviceDescriptor {
            display_name: format!("{} ({})", inner.model, inner.serial),
            id: inner.serial.clone(),
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeMap for MockCamera {
    fn has_node(&self, name: &str) -> bool {
        lock(&self.inner).nodes.contains_key(name)
    }

    async fn value(&self, name: &str) -> Result<NodeValue> {
        let inner = lock(&self.inner);
        if name == "PayloadSize" && inner.nodes.contains_key(name) {
            return Ok(NodeValue::Int(inner.payload_size()?));
        }
        inner
            .nodes
            .get(name)
            .ok_or_else(|| anyhow!("node '{}' not found", name))?
            .value
            .clone()
            .ok_or_else(|| anyhow!("'{}' is a command node", name))
    }

    async fn set_value(&self, name: &str, value: NodeValue) -> Result<()> {
        let mut inner = lock(&self.inner);
        let node = inner.check_writable(name)?;

        let numeric = match (&node.value, &value) {
            (Some(NodeValue::Bool(_)), NodeValue::Bool(_)) => None,
            (Some(NodeValue::Int(_)), NodeValue::Int(v)) => Some(*v as f64),
            (Some(NodeValue::Float(_)), NodeValue::Float(v)) => Some(*v),
            (current, _) => bail!("type mismatch writing {:?} to '{}' ({:?})", value, name, current),
        };
        if let (Some(v), Some(range)) = (numeric, node.range) {
            if !(range.min..=range.max).contains(&v) {
                bail!("{} outside [{}, {}] for '{}'", v, range.min, range.max, name);
            }
        }

        if let Some(node) = inner.nodes.get_mut(name) {
            node.value = Some(value.clone());
        }
        inner.writes.push((name.to_string(), value));
        if name.starts_with("Binning") {
            inner.apply_binning();
        }
        Ok(())
    }

    async fn set_current_entry(&self, name: &str, entry: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        let node = inner.check_writable(name)?;
        if !matches!(node.value, Some(NodeValue::Enum(_))) {
            bail!("'{}' is not an enumeration", name);
        }
        if !node.entries.iter().any(|e| e == entry) {
            bail!("'{}' has no entry '{}'", name, entry);
        }

        let value = NodeValue::Enum(entry.to_string());
        if let Some(node) = inner.nodes.get_mut(name) {
            node.value = Some(value.clone());
        }
        inner.writes.push((name.to_string(), value));
        Ok(())
    }

    async fn range(&self, name: &str) -> Result<NodeRange> {
        lock(&self.inner)
            .nodes
            .get(name)
            .ok_or_else(|| anyhow!("node '{}' not found", name))?
            .range
            .ok_or_else(|| anyhow!("'{}' is not numeric", name))
    }

    async fn execute(&self, name: &str) -> Result<()> {
        let frame = {
            let mut inner = lock(&self.inner);
            let node = inner
                .nodes
                .get(name)
                .ok_or_else(|| anyhow!("node '{}' not found", name))?;
            if node.value.is_some() {
                bail!("'{}' is not a command node", name);
            }
            if inner.rejected.contains(name) {
                bail!("access to '{}' denied", name);
            }

            let frame = match name {
                "AcquisitionStart" => {
                    if inner.fail_acquisition_start {
                        bail!("device refused to start acquisition");
                    }
                    inner.acquiring = true;
                    None
                }
                "AcquisitionStop" => {
                    inner.acquiring = false;
                    None
                }
                "TriggerSoftware" => {
                    if !inner.acquiring {
                        bail!("trigger ignored: acquisition not running");
                    }
                    inner.trigger_count += 1;
                    if inner.lost_triggers.contains(&inner.trigger_count) {
                        None
                    } else {
                        Some(inner.render_frame()?)
                    }
                }
                _ => None,
            };
            inner.executed.push(name.to_string());
            frame
        };

        if let Some((width, height, format, payload)) = frame {
            self.stream.fill_next(width, height, &format, payload);
        }
        Ok(())
    }

    async fn wait_until_done(&self, name: &str) -> Result<()> {
        if self.has_node(name) {
            Ok(())
        } else {
            bail!("node '{}' not found", name)
        }
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    fn display_name(&self) -> String {
        self.descriptor().display_name
    }

    fn node_map(&self) -> &dyn NodeMap {
        self
    }

    async fn data_stream_count(&self) -> Result<usize> {
        Ok(lock(&self.inner).data_streams)
    }

    async fn open_data_stream(&self) -> Result<Box<dyn DataStream>> {
        let inner = lock(&self.inner);
        if inner.fail_stream_open {
            bail!("data stream could not be opened");
        }
        if inner.data_streams == 0 {
            bail!("device has no data streams");
        }
        Ok(Box::new(self.stream.clone()))
    }

    async fn close(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.close_count += 1;
        inner.acquiring = false;
        Ok(())
    }
}

// =============================================================================
// MockCameraSystem - Simulated Camera SDK Library
// =============================================================================

#[derive(Debug)]
struct SystemInner {
    cameras: Vec<MockCamera>,
    initialized: bool,
    fail_initialize: bool,
    initialize_count: usize,
    close_count: usize,
}

/// Simulated camera SDK library.
#[derive(Debug, Clone)]
pub struct MockCameraSystem {
    inner: Arc<Mutex<SystemInner>>,
}

impl MockCameraSystem {
    /// Library with one attached camera.
    pub fn new(camera: MockCamera) -> Self {
        Self::with_cameras(vec![camera])
    }

    /// Library with no attached cameras.
    pub fn empty() -> Self {
        Self::with_cameras(Vec::new())
    }

    fn with_cameras(cameras: Vec<MockCamera>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SystemInner {
                cameras,
                initialized: false,
                fail_initialize: false,
                initialize_count: 0,
                close_count: 0,
            })),
        }
    }

    /// `initialize` fails.
    pub fn with_initialize_failure(self) -> Self {
        lock(&self.inner).fail_initialize = true;
        self
    }

    /// Whether the library is currently initialized.
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner).initialized
    }

    /// Number of successful `initialize` calls.
    pub fn initialize_count(&self) -> usize {
        lock(&self.inner).initialize_count
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        lock(&self.inner).close_count
    }

    fn require_initialized(&self) -> Result<()> {
        if lock(&self.inner).initialized {
            Ok(())
        } else {
            bail!("camera library not initialized")
        }
    }
}

#[async_trait]
impl CameraSystem for MockCameraSystem {
    fn initialize(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail_initialize {
            bail!("transport layer not found");
        }
        inner.initialized = true;
        inner.initialize_count += 1;
        Ok(())
    }

    fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.initialized = false;
        inner.close_count += 1;
    }

    async fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.require_initialized()?;
        let cameras = lock(&self.inner).cameras.clone();
        Ok(cameras.iter().map(MockCamera::descriptor).collect())
    }

    async fn open(&self, index: usize, access: AccessMode) -> Result<Box<dyn CameraDevice>> {
        self.require_initialized()?;
        let camera = lock(&self.inner)
            .cameras
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("no camera at index {}", index))?;
        lock(&camera.inner).last_access = Some(access);
        Ok(Box::new(camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_tracks_moves() {
        let stage = MockStage::new("1");
        stage.connect("1").await.unwrap();
        stage.move_to(2.0, Duration::from_secs(1)).await.unwrap();

        assert_eq!(MotionDevice::position(&stage).await.unwrap(), 2.0);
        assert_eq!(stage.moves(), vec![(2.0, Duration::from_secs(1))]);
    }

    #[tokio::test]
    async fn test_stage_rejects_moves_when_disconnected() {
        let stage = MockStage::new("1");
        assert!(stage.move_to(2.0, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_payload_size_follows_format_and_binning() {
        let camera = MockCamera::with_sensor(64, 48);
        assert_eq!(camera.value("PayloadSize").await.unwrap(), NodeValue::Int(64 * 48));

        camera
            .set_current_entry("PixelFormat", "Mono12g24IDS")
            .await
            .unwrap();
        camera
            .set_value("BinningHorizontal", NodeValue::Int(2))
            .await
            .unwrap();
        assert_eq!(camera.value("Width").await.unwrap(), NodeValue::Int(32));
        assert_eq!(
            camera.value("PayloadSize").await.unwrap(),
            NodeValue::Int(32 * 48 / 2 * 3)
        );
    }

    #[tokio::test]
    async fn test_locked_parameters_refuse_writes() {
        let camera = MockCamera::new();
        camera
            .set_value("TLParamsLocked", NodeValue::Int(1))
            .await
            .unwrap();

        assert!(camera.set_current_entry("PixelFormat", "Mono12").await.is_err());
        assert!(camera
            .set_value("ExposureTime", NodeValue::Float(5000.0))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_node_range_and_type_checks() {
        let camera = MockCamera::new();
        assert!(camera.set_value("Gain", NodeValue::Float(99.0)).await.is_err());
        assert!(camera.set_value("Gain", NodeValue::Int(2)).await.is_err());
        assert!(camera.set_current_entry("TriggerMode", "Maybe").await.is_err());
        assert!(camera.value("TriggerSoftware").await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_fills_queued_buffer() {
        let camera = MockCamera::new();
        let stream = camera.stream();
        let id = stream.alloc_and_announce_buffer(64 * 48).await.unwrap();
        stream.queue_buffer(id).await.unwrap();
        stream.start_acquisition().await.unwrap();
        camera.execute("AcquisitionStart").await.unwrap();

        camera.execute("TriggerSoftware").await.unwrap();

        let buffer = stream
            .wait_for_finished_buffer(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.id, id);
        assert_eq!((buffer.width, buffer.height), (64, 48));
        assert_eq!(buffer.payload.len(), 64 * 48);
    }

    #[tokio::test]
    async fn test_lost_frame_times_out() {
        let camera = MockCamera::new().with_lost_frame_at(1);
        let stream = camera.stream();
        let id = stream.alloc_and_announce_buffer(64 * 48).await.unwrap();
        stream.queue_buffer(id).await.unwrap();
        stream.start_acquisition().await.unwrap();
        camera.execute("AcquisitionStart").await.unwrap();

        camera.execute("TriggerSoftware").await.unwrap();

        let waited = stream
            .wait_for_finished_buffer(Duration::from_millis(5))
            .await
            .unwrap();
        assert!(waited.is_none());
        assert_eq!(stream.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_system_requires_initialize() {
        let system = MockCameraSystem::new(MockCamera::new());
        assert!(system.devices().await.is_err());

        system.initialize().unwrap();
        assert_eq!(system.devices().await.unwrap().len(), 1);

        system.close();
        assert!(!system.is_initialized());
        assert_eq!(system.close_count(), 1);
    }
}
