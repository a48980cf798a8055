//! Device Capability Surfaces
//!
//! The vendor SDKs the scan runs against are not reimplemented here. Each
//! SDK is reached through a small capability trait that an adapter (or the
//! simulated rig in [`crate::hardware::mock`]) implements:
//!
//! - [`StageManager`] + [`MotionDevice`] - stage discovery and a single servo controller
//! - [`CameraSystem`] + [`CameraDevice`] - camera SDK library, discovery and one opened device
//! - [`NodeMap`] - the device's string-keyed property registry
//! - [`DataStream`] - the frame transport with announced/queued buffers
//! - [`ImageCodec`] - buffer decoding, pixel format conversion and file writing
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait]) unless it must be callable from `Drop`
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors; components convert them into `ScanError`
//! - Mirrors one vendor object, nothing more
//!
//! All methods take `&self`; adapters use interior mutability for state.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::data::Frame;
use crate::instrument::camera::OutputFormat;

// =============================================================================
// Motion
// =============================================================================

/// Capability: Stage Discovery
///
/// Builds the list of attached controllers and creates a handle for one of them.
#[async_trait]
pub trait StageManager: Send + Sync {
    /// Serial numbers of every attached controller.
    async fn device_list(&self) -> Result<Vec<String>>;

    /// Create an unconnected handle for `serial`.
    async fn create(&self, serial: &str) -> Result<Box<dyn MotionDevice>>;
}

/// Capability: Servo Motion Controller
///
/// A single-axis servo controller. Every motion call blocks until the move
/// completes or the driver-side timeout elapses.
#[async_trait]
pub trait MotionDevice: Send + Sync {
    /// Open the connection to the controller.
    async fn connect(&self, serial: &str) -> Result<()>;

    /// Ask the driver to sample status and position every `interval`.
    async fn start_polling(&self, interval: Duration) -> Result<()>;

    /// Energise the actuator.
    async fn enable(&self) -> Result<()>;

    /// Human-readable device description.
    async fn description(&self) -> Result<String>;

    /// Whether the controller has pushed its settings to the host.
    async fn is_settings_initialized(&self) -> Result<bool>;

    /// Block until settings are initialized or `timeout` elapses.
    async fn wait_for_settings_initialized(&self, timeout: Duration) -> Result<()>;

    /// Load the named motion profile for `serial` and apply it to the controller.
    async fn load_configuration(&self, serial: &str, profile: &str) -> Result<()>;

    /// Blocking reference move that establishes the zero position.
    async fn home(&self, timeout: Duration) -> Result<()>;

    /// Blocking absolute move in millimeters.
    async fn move_to(&self, position_mm: f64, timeout: Duration) -> Result<()>;

    /// Last position reported by the polling loop, in millimeters.
    async fn position(&self) -> Result<f64>;

    /// Stop polling and release the connection.
    async fn disconnect(&self) -> Result<()>;
}

// =============================================================================
// Camera
// =============================================================================

/// Requested level of device access when opening a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only access; properties cannot be written.
    ReadOnly,
    /// Exclusive control access.
    Control,
}

/// Summary of a discovered camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Model and serial as reported by the transport layer.
    pub display_name: String,
    /// Transport-layer identifier.
    pub id: String,
}

/// Capability: Camera SDK Library
///
/// Process-wide SDK state. `initialize` and `close` are synchronous so that a
/// scoped guard can release the library from `Drop`.
#[async_trait]
pub trait CameraSystem: Send + Sync {
    /// Initialize the SDK. Must precede any other call.
    fn initialize(&self) -> Result<()>;

    /// Release the SDK and everything still opened through it.
    fn close(&self);

    /// Refresh and return the list of discovered cameras.
    async fn devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open the camera at `index` in the last discovered list.
    async fn open(&self, index: usize, access: AccessMode) -> Result<Box<dyn CameraDevice>>;
}

/// Capability: Opened Camera
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Model and serial of the opened device.
    fn display_name(&self) -> String;

    /// Property registry of the remote device.
    fn node_map(&self) -> &dyn NodeMap;

    /// Number of data streams the device exposes.
    async fn data_stream_count(&self) -> Result<usize>;

    /// Open the first data stream.
    async fn open_data_stream(&self) -> Result<Box<dyn DataStream>>;

    /// Release the device.
    async fn close(&self) -> Result<()>;
}

/// Dynamically typed value of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    /// Boolean node.
    Bool(bool),
    /// Integer node.
    Int(i64),
    /// Floating point node.
    Float(f64),
    /// Enumeration node, by entry name.
    Enum(String),
}

/// Limits of a numeric node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeRange {
    /// Smallest accepted value.
    pub min: f64,
    /// Largest accepted value.
    pub max: f64,
    /// Step between accepted values, when the node has a constant increment.
    pub increment: Option<f64>,
}

/// Capability: Node Map
///
/// String-keyed property registry. The rest of the crate reaches it only
/// through [`crate::instrument::nodes`], which validates names once at open.
#[async_trait]
pub trait NodeMap: Send + Sync {
    /// Whether the device exposes a node with this name.
    fn has_node(&self, name: &str) -> bool;

    /// Current value of a node.
    async fn value(&self, name: &str) -> Result<NodeValue>;

    /// Write a boolean, integer or float node.
    async fn set_value(&self, name: &str, value: NodeValue) -> Result<()>;

    /// Select an entry of an enumeration node.
    async fn set_current_entry(&self, name: &str, entry: &str) -> Result<()>;

    /// Limits of a numeric node.
    async fn range(&self, name: &str) -> Result<NodeRange>;

    /// Execute a command node.
    async fn execute(&self, name: &str) -> Result<()>;

    /// Block until a previously executed command node reports completion.
    async fn wait_until_done(&self, name: &str) -> Result<()>;
}

/// Identifier of a buffer announced to a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// A buffer the driver has finished filling.
#[derive(Debug, Clone)]
pub struct FilledBuffer {
    /// Which announced buffer carries the frame.
    pub id: BufferId,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format name of the payload (e.g. `Mono12g24IDS`).
    pub pixel_format: String,
    /// Driver frame counter.
    pub frame_id: u64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Flush behaviour for [`DataStream::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Discard every queued and filled buffer, returning them to announced.
    DiscardAll,
}

/// Capability: Data Stream
#[async_trait]
pub trait DataStream: Send + Sync {
    /// Move buffers out of the input/output queues.
    async fn flush(&self, mode: FlushMode) -> Result<()>;

    /// Every buffer currently announced to the stream.
    async fn announced_buffers(&self) -> Result<Vec<BufferId>>;

    /// Remove a buffer from the stream and free it.
    async fn revoke_buffer(&self, id: BufferId) -> Result<()>;

    /// Minimum number of announced buffers the driver needs to stream.
    async fn min_required_buffers(&self) -> Result<usize>;

    /// Allocate a buffer of `size` bytes and announce it.
    async fn alloc_and_announce_buffer(&self, size: usize) -> Result<BufferId>;

    /// Hand an announced buffer to the driver for filling.
    async fn queue_buffer(&self, id: BufferId) -> Result<()>;

    /// Wait for the next filled buffer. `Ok(None)` means the timeout elapsed.
    async fn wait_for_finished_buffer(&self, timeout: Duration) -> Result<Option<FilledBuffer>>;

    /// Start the driver's acquisition engine.
    async fn start_acquisition(&self) -> Result<()>;

    /// Stop the driver's acquisition engine.
    async fn stop_acquisition(&self) -> Result<()>;
}

// =============================================================================
// Imaging
// =============================================================================

/// Capability: Image Codec
///
/// CPU-only work, therefore synchronous.
pub trait ImageCodec: Send + Sync {
    /// Decode a filled buffer into an image in its native pixel format.
    fn buffer_to_image(&self, buffer: &FilledBuffer) -> Result<Frame>;

    /// Convert an image to the requested output format.
    fn convert_to(&self, frame: &Frame, format: OutputFormat) -> Result<Frame>;

    /// Persist an image at `path`.
    fn write_image(&self, path: &Path, frame: &Frame) -> Result<()>;
}
