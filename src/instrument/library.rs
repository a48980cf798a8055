//! Scoped camera SDK lifetime.
//!
//! The SDK must be initialized before discovery and closed exactly once on
//! every exit path. [`CameraLibrary`] ties both to a value: creating it
//! initializes the library, dropping it (or calling [`CameraLibrary::close`])
//! closes it. Unwinding through a scope that owns the guard still closes
//! the library.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::CameraSystem;

/// Initialized camera SDK, closed on drop.
pub struct CameraLibrary {
    system: Arc<dyn CameraSystem>,
    open: bool,
}

impl CameraLibrary {
    /// Initialize the SDK.
    ///
    /// # Errors
    /// `Connection` if the SDK cannot be initialized. Nothing needs closing
    /// in that case.
    pub fn initialize(system: Arc<dyn CameraSystem>) -> ScanResult<Self> {
        system.initialize().map_err(|e| {
            warn!(error = %e, "Camera library initialization failed");
            ScanError::Connection(format!("camera library initialization failed: {e}"))
        })?;
        info!("Camera library initialized");
        Ok(Self { system, open: true })
    }

    /// The initialized SDK.
    pub fn system(&self) -> &dyn CameraSystem {
        self.system.as_ref()
    }

    /// Close the SDK now instead of at drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.system.close();
            info!("Camera library closed");
        }
    }
}

impl Drop for CameraLibrary {
    fn drop(&mut self) {
        self.release();
    }
}
