//! Motorized Linear Stage
//!
//! [`MotionController`] owns one servo controller for the lifetime of a
//! scan. Every requested target is clamped into `[0, max_position]` before it
//! reaches the device; clamping is silent. Moves block until the device
//! reports completion, bounded by a timeout proportional to travel distance.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut stage = MotionController::create(&manager, "27601295", TravelLimits::new(25.0)).await?;
//! stage.initialize(true, "MTS25/M-Z8").await?;
//! stage.move_absolute(0.0).await?;
//! let position = stage.move_relative(0.0008).await?;
//! stage.close().await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DeviceKind, ScanError, ScanResult};
use crate::hardware::capabilities::{MotionDevice, StageManager};

/// Milliseconds of move budget per millimeter of travel.
pub const MOVE_TIMEOUT_FACTOR_MS: f64 = 420.0;

/// Travel-independent part of the move budget, in millimeters.
pub const MOVE_TIMEOUT_OFFSET_MM: f64 = 5.0;

/// Extra time granted on top of a driver-side timeout before the host gives up.
const DRIVER_GRACE: Duration = Duration::from_millis(500);

/// Timeout for a move covering `distance_mm`: `(|d| + 5) * 420` ms.
pub fn move_timeout(distance_mm: f64) -> Duration {
    let ms = (distance_mm.abs() + MOVE_TIMEOUT_OFFSET_MM) * MOVE_TIMEOUT_FACTOR_MS;
    Duration::from_millis(ms as u64)
}

/// Soft travel range of the stage in millimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelLimits {
    /// Lower bound, always 0.
    pub min_mm: f64,
    /// Upper bound.
    pub max_mm: f64,
}

impl TravelLimits {
    /// Range `[0, max_mm]`.
    pub fn new(max_mm: f64) -> Self {
        Self {
            min_mm: 0.0,
            max_mm,
        }
    }

    /// Clamp a target into range.
    pub fn clamp(&self, target_mm: f64) -> f64 {
        target_mm.clamp(self.min_mm, self.max_mm)
    }
}

/// Requested motion, before clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Move by a signed distance from the current position.
    Relative(f64),
    /// Move to an absolute position.
    Absolute(f64),
}

/// A motion command resolved against the current position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedMove {
    /// Clamped absolute target.
    pub target_mm: f64,
    /// Whether clamping changed the requested target.
    pub clamped: bool,
    /// Move budget for the travel distance.
    pub timeout: Duration,
}

impl MotionCommand {
    /// Clamp the command into `limits` and compute its timeout.
    ///
    /// A NaN request resolves to the current position.
    pub fn resolve(self, current_mm: f64, limits: &TravelLimits) -> ResolvedMove {
        let requested = match self {
            MotionCommand::Relative(delta) => current_mm + delta,
            MotionCommand::Absolute(target) => target,
        };
        let requested = if requested.is_nan() {
            current_mm
        } else {
            requested
        };
        let target_mm = limits.clamp(requested);
        ResolvedMove {
            target_mm,
            clamped: target_mm != requested,
            timeout: move_timeout(target_mm - current_mm),
        }
    }
}

/// Host-side view of the stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageState {
    /// Connection is open.
    pub connected: bool,
    /// Homing completed during this session.
    pub homed: bool,
    /// Last position reported after a move, in millimeters.
    pub current_position: f64,
    /// Lower travel limit.
    pub min_position: f64,
    /// Upper travel limit.
    pub max_position: f64,
}

/// Wait bounds used while bringing the stage up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimings {
    /// Position polling interval requested from the driver.
    pub polling_interval: Duration,
    /// Pause after connect, polling start and enable.
    pub init_settle: Duration,
    /// Bound on the settings-initialized wait.
    pub settings_timeout: Duration,
    /// Bound on the homing move.
    pub homing_timeout: Duration,
}

impl Default for StageTimings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(250),
            init_settle: Duration::from_millis(250),
            settings_timeout: Duration::from_secs(10),
            homing_timeout: Duration::from_secs(60),
        }
    }
}

/// Run a driver call with its own timeout plus a host-side bound.
async fn bounded<T, F>(timeout: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout + DRIVER_GRACE, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "no response within {} ms",
            (timeout + DRIVER_GRACE).as_millis()
        )),
    }
}

/// Owned connection to the motorized stage.
pub struct MotionController {
    serial: String,
    device: Option<Box<dyn MotionDevice>>,
    state: StageState,
    limits: TravelLimits,
    timings: StageTimings,
}

impl MotionController {
    /// Look up `serial` among the attached controllers and create its handle.
    ///
    /// # Errors
    /// `DeviceNotFound` if the serial is not attached, `Connection` if the
    /// device list or handle cannot be obtained.
    pub async fn create(
        manager: &dyn StageManager,
        serial: &str,
        limits: TravelLimits,
    ) -> ScanResult<Self> {
        let serials = manager.device_list().await.map_err(|e| {
            warn!(error = %e, "Failed to build stage device list");
            ScanError::Connection(format!("device list unavailable: {e}"))
        })?;

        if !serials.iter().any(|s| s == serial) {
            warn!(serial, available = ?serials, "Stage not found");
            return Err(ScanError::DeviceNotFound {
                kind: DeviceKind::Stage,
                id: serial.to_string(),
            });
        }

        let device = manager.create(serial).await.map_err(|e| {
            warn!(serial, error = %e, "Failed to create stage handle");
            ScanError::Connection(format!("cannot create handle for {serial}: {e}"))
        })?;

        info!(serial, "Stage handle created");
        Ok(Self {
            serial: serial.to_string(),
            device: Some(device),
            state: StageState {
                connected: false,
                homed: false,
                current_position: 0.0,
                min_position: limits.min_mm,
                max_position: limits.max_mm,
            },
            limits,
            timings: StageTimings::default(),
        })
    }

    /// Override the initialization wait bounds.
    pub fn with_timings(mut self, timings: StageTimings) -> Self {
        self.timings = timings;
        self
    }

    fn device(&self) -> ScanResult<&dyn MotionDevice> {
        self.device
            .as_deref()
            .ok_or_else(|| ScanError::Connection(format!("stage {} is closed", self.serial)))
    }

    /// Connect, start polling, enable, wait for settings and apply `profile`.
    /// Homes the actuator when `home` is set.
    ///
    /// # Errors
    /// Every failure is fatal for the session: `Connection`, `SettingsTimeout`
    /// or `HomingFailure`.
    pub async fn initialize(&mut self, home: bool, profile: &str) -> ScanResult<()> {
        let serial = self.serial.clone();
        let timings = self.timings;
        let device = self.device()?;

        let connection = |step: &str, e: anyhow::Error| {
            warn!(serial = %serial, step, error = %e, "Stage initialization failed");
            ScanError::Connection(format!("{step} failed for {serial}: {e}"))
        };

        device
            .connect(&serial)
            .await
            .map_err(|e| connection("connect", e))?;
        self.state.connected = true;
        let device = self.device()?;
        tokio::time::sleep(timings.init_settle).await;

        device
            .start_polling(timings.polling_interval)
            .await
            .map_err(|e| connection("start polling", e))?;
        tokio::time::sleep(timings.init_settle).await;

        device
            .enable()
            .await
            .map_err(|e| connection("enable", e))?;
        tokio::time::sleep(timings.init_settle).await;

        match device.description().await {
            Ok(description) => info!(serial = %serial, %description, "Stage connected"),
            Err(e) => debug!(serial = %serial, error = %e, "Stage description unavailable"),
        }

        let initialized = device.is_settings_initialized().await.unwrap_or(false);
        if !initialized {
            debug!(serial = %serial, "Waiting for stage settings");
            let waited = bounded(
                timings.settings_timeout,
                device.wait_for_settings_initialized(timings.settings_timeout),
            )
            .await;
            let ready = waited.is_ok() && device.is_settings_initialized().await.unwrap_or(false);
            if !ready {
                warn!(serial = %serial, "Stage settings did not initialize");
                return Err(ScanError::SettingsTimeout {
                    timeout_ms: timings.settings_timeout.as_millis() as u64,
                });
            }
        }

        device
            .load_configuration(&serial, profile)
            .await
            .map_err(|e| connection("load motion profile", e))?;
        info!(serial = %serial, profile, "Motion profile applied");

        self.state.current_position = self.limits.clamp(self.get_position().await);

        if home {
            self.home().await?;
        }

        info!(serial = %serial, position_mm = self.state.current_position, "Stage initialized");
        Ok(())
    }

    /// Blocking homing move.
    ///
    /// # Errors
    /// `HomingFailure` if the device rejects or does not finish the move.
    pub async fn home(&mut self) -> ScanResult<()> {
        let timeout = self.timings.homing_timeout;
        let device = self.device()?;
        info!(serial = %self.serial, "Homing actuator");

        bounded(timeout, device.home(timeout)).await.map_err(|e| {
            warn!(serial = %self.serial, error = %e, "Homing failed");
            ScanError::HomingFailure(e.to_string())
        })?;

        self.state.homed = true;
        self.state.current_position = self.limits.clamp(self.get_position().await);
        info!(serial = %self.serial, "Actuator homed");
        Ok(())
    }

    /// Move by `delta_mm`, clamped into the travel range. Returns the new position.
    pub async fn move_relative(&mut self, delta_mm: f64) -> ScanResult<f64> {
        self.execute(MotionCommand::Relative(delta_mm)).await
    }

    /// Move to `target_mm`, clamped into the travel range. Returns the new position.
    pub async fn move_absolute(&mut self, target_mm: f64) -> ScanResult<f64> {
        self.execute(MotionCommand::Absolute(target_mm)).await
    }

    /// Resolve and issue a motion command.
    ///
    /// # Errors
    /// `Connection` when the stage is not connected, `MoveTimeout` when the
    /// device fails or does not finish the move in time.
    pub async fn execute(&mut self, command: MotionCommand) -> ScanResult<f64> {
        if !self.state.connected {
            return Err(ScanError::Connection(format!(
                "stage {} is not connected",
                self.serial
            )));
        }

        let current = self.get_position().await;
        let resolved = command.resolve(current, &self.limits);
        if resolved.clamped {
            debug!(
                serial = %self.serial,
                ?command,
                target_mm = resolved.target_mm,
                "Target clamped to travel range"
            );
        }

        let device = self.device()?;
        bounded(resolved.timeout, device.move_to(resolved.target_mm, resolved.timeout))
            .await
            .map_err(|e| {
                warn!(
                    serial = %self.serial,
                    target_mm = resolved.target_mm,
                    timeout_ms = resolved.timeout.as_millis() as u64,
                    error = %e,
                    "Move failed"
                );
                ScanError::MoveTimeout {
                    target_mm: resolved.target_mm,
                    timeout_ms: resolved.timeout.as_millis() as u64,
                    reason: e.to_string(),
                }
            })?;

        let reported = device.position().await.unwrap_or(resolved.target_mm);
        self.state.current_position = self.limits.clamp(reported);
        debug!(serial = %self.serial, position_mm = self.state.current_position, "Move complete");
        Ok(self.state.current_position)
    }

    /// Position reported by the device, or the last known position when the
    /// query fails.
    pub async fn get_position(&self) -> f64 {
        let Some(device) = self.device.as_deref() else {
            return self.state.current_position;
        };
        match device.position().await {
            Ok(position) => position,
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "Position query failed; using last known");
                self.state.current_position
            }
        }
    }

    /// Disconnect. Calling it again is a no-op.
    pub async fn close(&mut self) -> ScanResult<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        if self.state.connected {
            match device.disconnect().await {
                Ok(()) => info!(serial = %self.serial, "Stage disconnected"),
                Err(e) => warn!(serial = %self.serial, error = %e, "Stage disconnect failed"),
            }
        }
        self.state.connected = false;
        Ok(())
    }

    /// Host-side stage state.
    pub fn state(&self) -> &StageState {
        &self.state
    }

    /// Serial number of the controller.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Travel range.
    pub fn limits(&self) -> TravelLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockStage, MockStageManager};

    fn fast_timings() -> StageTimings {
        StageTimings {
            polling_interval: Duration::from_millis(1),
            init_settle: Duration::ZERO,
            settings_timeout: Duration::from_millis(50),
            homing_timeout: Duration::from_millis(200),
        }
    }

    async fn connected(stage: &MockStage, max_mm: f64) -> MotionController {
        let manager = MockStageManager::new(stage.clone());
        let mut controller =
            MotionController::create(&manager, stage.serial().as_str(), TravelLimits::new(max_mm))
                .await
                .unwrap()
                .with_timings(fast_timings());
        controller.initialize(false, "MTS25/M-Z8").await.unwrap();
        controller
    }

    #[test]
    fn test_timeout_formula() {
        assert_eq!(move_timeout(0.0), Duration::from_millis(2100));
        assert_eq!(move_timeout(1.0), Duration::from_millis(2520));
        assert_eq!(move_timeout(-1.0), Duration::from_millis(2520));
        assert_eq!(move_timeout(25.0), Duration::from_millis(12_600));
    }

    #[test]
    fn test_timeout_is_monotonic() {
        let mut previous = Duration::ZERO;
        for step in 0..100 {
            let timeout = move_timeout(step as f64 * 0.25);
            assert!(timeout >= previous);
            previous = timeout;
        }
    }

    #[test]
    fn test_resolve_clamps_both_bounds() {
        let limits = TravelLimits::new(25.0);
        let high = MotionCommand::Absolute(35.0).resolve(10.0, &limits);
        assert_eq!(high.target_mm, 25.0);
        assert!(high.clamped);
        assert_eq!(high.timeout, move_timeout(15.0));

        let low = MotionCommand::Relative(-4.0).resolve(1.0, &limits);
        assert_eq!(low.target_mm, 0.0);
        assert!(low.clamped);

        let inside = MotionCommand::Relative(0.5).resolve(1.0, &limits);
        assert_eq!(inside.target_mm, 1.5);
        assert!(!inside.clamped);
    }

    #[test]
    fn test_resolve_stays_in_range_for_any_request() {
        let limits = TravelLimits::new(25.0);
        let requests = [-1e9, -25.0, -0.1, 0.0, 0.0008, 12.5, 25.0, 25.0001, 1e9];
        for &current in &[0.0, 12.5, 25.0] {
            for &r in &requests {
                for command in [MotionCommand::Absolute(r), MotionCommand::Relative(r)] {
                    let resolved = command.resolve(current, &limits);
                    assert!((0.0..=25.0).contains(&resolved.target_mm));
                }
            }
        }
    }

    #[test]
    fn test_nan_request_holds_position() {
        let limits = TravelLimits::new(25.0);
        let resolved = MotionCommand::Relative(f64::NAN).resolve(3.0, &limits);
        assert_eq!(resolved.target_mm, 3.0);
    }

    #[tokio::test]
    async fn test_create_unknown_serial() {
        let manager = MockStageManager::new(MockStage::new("27601295"));
        let result = MotionController::create(&manager, "00000000", TravelLimits::new(25.0)).await;
        assert!(matches!(
            result,
            Err(ScanError::DeviceNotFound {
                kind: DeviceKind::Stage,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_initialize_applies_profile_and_homes() {
        let stage = MockStage::new("27601295").with_position(7.0);
        let manager = MockStageManager::new(stage.clone());
        let mut controller =
            MotionController::create(&manager, "27601295", TravelLimits::new(25.0))
                .await
                .unwrap()
                .with_timings(fast_timings());

        controller.initialize(true, "MTS25/M-Z8").await.unwrap();

        assert!(stage.is_connected());
        assert!(stage.is_polling());
        assert_eq!(stage.profile().as_deref(), Some("MTS25/M-Z8"));
        assert!(controller.state().homed);
        assert_eq!(controller.state().current_position, 0.0);
    }

    #[tokio::test]
    async fn test_initialize_clamps_out_of_range_position() {
        let stage = MockStage::new("27601295").with_position(30.0);
        let manager = MockStageManager::new(stage.clone());
        let mut controller =
            MotionController::create(&manager, "27601295", TravelLimits::new(25.0))
                .await
                .unwrap()
                .with_timings(fast_timings());

        controller.initialize(false, "MTS25/M-Z8").await.unwrap();
        assert_eq!(controller.state().current_position, 25.0);

        stage.set_position_query_failure(true);
        assert_eq!(controller.get_position().await, 25.0);
    }

    #[tokio::test]
    async fn test_settings_timeout_is_fatal() {
        let stage = MockStage::new("27601295").with_settings_never_initialized();
        let manager = MockStageManager::new(stage);
        let mut controller =
            MotionController::create(&manager, "27601295", TravelLimits::new(25.0))
                .await
                .unwrap()
                .with_timings(fast_timings());

        let result = controller.initialize(false, "MTS25/M-Z8").await;
        assert!(matches!(result, Err(ScanError::SettingsTimeout { .. })));
    }

    #[tokio::test]
    async fn test_homing_failure_is_fatal() {
        let stage = MockStage::new("27601295").with_homing_failure();
        let manager = MockStageManager::new(stage);
        let mut controller =
            MotionController::create(&manager, "27601295", TravelLimits::new(25.0))
                .await
                .unwrap()
                .with_timings(fast_timings());

        let result = controller.initialize(true, "MTS25/M-Z8").await;
        assert!(matches!(result, Err(ScanError::HomingFailure(_))));
    }

    #[tokio::test]
    async fn test_move_past_max_clamps_silently() {
        let stage = MockStage::new("27601295");
        let mut controller = connected(&stage, 25.0).await;

        let position = controller.move_absolute(25.0 + 10.0).await.unwrap();
        assert_eq!(position, 25.0);
        assert_eq!(stage.position(), 25.0);

        let position = controller.move_relative(-100.0).await.unwrap();
        assert_eq!(position, 0.0);
    }

    #[tokio::test]
    async fn test_relative_round_trip() {
        let stage = MockStage::new("27601295").with_position(10.0);
        let mut controller = connected(&stage, 25.0).await;

        let start = controller.get_position().await;
        controller.move_relative(2.5).await.unwrap();
        let back = controller.move_relative(-2.5).await.unwrap();
        assert!((back - start).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_move_issues_computed_timeout() {
        let stage = MockStage::new("27601295").with_position(1.0);
        let mut controller = connected(&stage, 25.0).await;

        controller.move_absolute(3.0).await.unwrap();
        let (target, timeout) = stage.moves().last().copied().unwrap();
        assert_eq!(target, 3.0);
        assert_eq!(timeout, move_timeout(2.0));
    }

    #[tokio::test]
    async fn test_failed_move_is_move_timeout() {
        let stage = MockStage::new("27601295").with_move_failure_at(1);
        let mut controller = connected(&stage, 25.0).await;

        let result = controller.move_relative(1.0).await;
        assert!(matches!(result, Err(ScanError::MoveTimeout { .. })));
    }

    #[tokio::test]
    async fn test_position_query_failure_returns_last_known() {
        let stage = MockStage::new("27601295").with_position(4.0);
        let mut controller = connected(&stage, 25.0).await;
        controller.move_absolute(5.0).await.unwrap();

        stage.set_position_query_failure(true);
        assert_eq!(controller.get_position().await, 5.0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stage = MockStage::new("27601295");
        let mut controller = connected(&stage, 25.0).await;

        controller.close().await.unwrap();
        controller.close().await.unwrap();
        assert_eq!(stage.disconnect_count(), 1);
        assert!(!controller.state().connected);

        let result = controller.move_relative(1.0).await;
        assert!(matches!(result, Err(ScanError::Connection(_))));
    }
}
