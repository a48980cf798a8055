//! Capture buffer pool for software-triggered acquisition.
//!
//! The pool tracks every buffer announced to the camera's data stream and
//! its position in the driver rotation:
//!
//! ```text
//! Free -> Announced -> Queued -> Filled -> Queued -> ...
//!                         \______ flush ______/ -> Announced -> revoked
//! ```
//!
//! # Design
//!
//! The driver decides how many buffers it needs (`min_required_buffers`).
//! `prepare` always tears the previous set down (flush, revoke) before
//! allocating, so repeated preparation never leaks announced buffers. Every
//! buffer handed out by `wait_for_filled` must come back through `requeue`;
//! if the driver refuses it, the buffer leaves the pool and the pool shrinks
//! by exactly that one buffer.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{BufferId, DataStream, FilledBuffer, FlushMode};

/// Extra time granted on top of the driver wait before the host gives up.
const WAIT_GRACE: Duration = Duration::from_millis(250);

/// Position of a buffer in the driver rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated host memory that has not been announced.
    Free,
    /// Known to the driver but not queued for filling.
    Announced,
    /// Lent to the driver, waiting for a frame.
    Queued,
    /// Holding a frame that has not been returned yet.
    Filled,
}

/// One pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    /// Driver identifier.
    pub id: BufferId,
    /// Size in bytes.
    pub payload_size: usize,
    /// Rotation state.
    pub state: BufferState,
}

/// Fixed set of capture buffers announced to one data stream.
#[derive(Debug, Default)]
pub struct FrameBufferPool {
    buffers: BTreeMap<BufferId, CaptureBuffer>,
    payload_size: usize,
}

impl FrameBufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down any previous buffer set and announce the driver's minimum
    /// number of buffers of `payload_size` bytes, queuing each one.
    ///
    /// # Errors
    /// `BufferPreparation` naming the driver call that failed.
    pub async fn prepare(&mut self, stream: &dyn DataStream, payload_size: usize) -> ScanResult<()> {
        if payload_size == 0 {
            return Err(ScanError::BufferPreparation(
                "payload size reported as 0 bytes".to_string(),
            ));
        }

        self.release(stream).await?;

        let required = stream.min_required_buffers().await.map_err(|e| {
            warn!(error = %e, "Failed to read minimum buffer count");
            ScanError::BufferPreparation(format!("minimum buffer count unavailable: {e}"))
        })?;

        for _ in 0..required {
            let id = stream
                .alloc_and_announce_buffer(payload_size)
                .await
                .map_err(|e| {
                    warn!(payload_size, error = %e, "Buffer allocation failed");
                    ScanError::BufferPreparation(format!("allocation of {payload_size} bytes failed: {e}"))
                })?;
            self.buffers.insert(
                id,
                CaptureBuffer {
                    id,
                    payload_size,
                    state: BufferState::Announced,
                },
            );

            stream.queue_buffer(id).await.map_err(|e| {
                warn!(?id, error = %e, "Queuing new buffer failed");
                ScanError::BufferPreparation(format!("queuing buffer {} failed: {e}", id.0))
            })?;
            self.set_state(id, BufferState::Queued);
        }

        self.payload_size = payload_size;
        info!(
            buffers = required,
            payload_size,
            total_mb = (required * payload_size) as f64 / (1024.0 * 1024.0),
            "Capture buffers announced"
        );
        Ok(())
    }

    /// Flush the stream and revoke every announced buffer.
    ///
    /// Used by `prepare` and on stream teardown. The driver's own list of
    /// announced buffers is authoritative, so buffers the pool lost track of
    /// are revoked too.
    pub async fn release(&mut self, stream: &dyn DataStream) -> ScanResult<()> {
        stream.flush(FlushMode::DiscardAll).await.map_err(|e| {
            warn!(error = %e, "Stream flush failed");
            ScanError::BufferPreparation(format!("flush failed: {e}"))
        })?;
        for buffer in self.buffers.values_mut() {
            buffer.state = BufferState::Announced;
        }

        let announced = stream.announced_buffers().await.map_err(|e| {
            ScanError::BufferPreparation(format!("announced buffer list unavailable: {e}"))
        })?;
        for id in announced {
            stream.revoke_buffer(id).await.map_err(|e| {
                warn!(?id, error = %e, "Buffer revoke failed");
                ScanError::BufferPreparation(format!("revoking buffer {} failed: {e}", id.0))
            })?;
            self.buffers.remove(&id);
        }

        if !self.buffers.is_empty() {
            debug!(stale = self.buffers.len(), "Dropping buffers unknown to the driver");
            self.buffers.clear();
        }
        Ok(())
    }

    /// Wait for the driver to hand back a filled buffer.
    ///
    /// # Errors
    /// `CaptureTimeout` when nothing arrives in time, `Capture` when the
    /// driver reports an error.
    pub async fn wait_for_filled(
        &mut self,
        stream: &dyn DataStream,
        timeout: Duration,
    ) -> ScanResult<FilledBuffer> {
        let timeout_ms = timeout.as_millis() as u64;
        let waited = tokio::time::timeout(timeout + WAIT_GRACE, stream.wait_for_finished_buffer(timeout)).await;

        let buffer = match waited {
            Ok(Ok(Some(buffer))) => buffer,
            Ok(Ok(None)) | Err(_) => return Err(ScanError::CaptureTimeout { timeout_ms }),
            Ok(Err(e)) => {
                warn!(error = %e, "Waiting for a filled buffer failed");
                return Err(ScanError::Capture(format!("buffer wait failed: {e}")));
            }
        };

        if self.buffers.contains_key(&buffer.id) {
            self.set_state(buffer.id, BufferState::Filled);
        } else {
            warn!(id = ?buffer.id, "Driver returned a buffer the pool does not own");
        }
        Ok(buffer)
    }

    /// Return a consumed buffer to the driver queue.
    ///
    /// # Errors
    /// `Capture` when the driver refuses the buffer; the buffer is dropped
    /// from the pool.
    pub async fn requeue(&mut self, stream: &dyn DataStream, id: BufferId) -> ScanResult<()> {
        match stream.queue_buffer(id).await {
            Ok(()) => {
                if self.buffers.contains_key(&id) {
                    self.set_state(id, BufferState::Queued);
                }
                Ok(())
            }
            Err(e) => {
                self.buffers.remove(&id);
                warn!(?id, remaining = self.buffers.len(), error = %e, "Buffer lost from rotation");
                Err(ScanError::Capture(format!("requeue of buffer {} failed: {e}", id.0)))
            }
        }
    }

    fn set_state(&mut self, id: BufferId, state: BufferState) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.state = state;
        }
    }

    /// Number of buffers owned by the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool owns no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers in `state`.
    pub fn count(&self, state: BufferState) -> usize {
        self.buffers.values().filter(|b| b.state == state).count()
    }

    /// All buffers, ordered by id.
    pub fn buffers(&self) -> impl Iterator<Item = &CaptureBuffer> {
        self.buffers.values()
    }

    /// Size of each buffer from the last `prepare`.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }
}
