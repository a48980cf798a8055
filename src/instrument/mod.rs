//! Device sessions built on the capability traits.
//!
//! - [`stage`] - `MotionController`, clamped blocking moves with distance-scaled timeouts
//! - [`camera`] - idle and streaming camera sessions, software-triggered capture
//! - [`frame_pool`] - capture buffers announced to the data stream
//! - [`nodes`] - typed registry of the camera nodes the scan uses
//! - [`library`] - scoped camera SDK initialization

pub mod camera;
pub mod frame_pool;
pub mod library;
pub mod nodes;
pub mod stage;

pub use camera::{AcquisitionConfig, CameraSession, StreamingSession};
pub use frame_pool::{BufferState, FrameBufferPool};
pub use library::CameraLibrary;
pub use stage::{MotionController, StageState, TravelLimits};
