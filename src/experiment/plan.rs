//! Step plan of a scan.

use std::time::Duration;

use crate::instrument::stage::TravelLimits;

/// What one scan does: move to `initial_position_mm`, then `step_count`
/// times move by `step_size_mm` and capture a frame.
///
/// The total excursion is not checked against the travel range up front;
/// steps past the limit saturate there.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Relative move per iteration in millimeters.
    pub step_size_mm: f64,
    /// Number of move+capture iterations.
    pub step_count: u32,
    /// Absolute start position in millimeters.
    pub initial_position_mm: f64,
    /// Settling wait after each move, the initial one included.
    pub settle: Duration,
    /// Home the stage before moving to the start position.
    pub home: bool,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            step_size_mm: 0.8 / 1000.0,
            step_count: 31,
            initial_position_mm: 0.0,
            settle: Duration::from_secs(1),
            home: true,
        }
    }
}

impl ScanPlan {
    /// Stage positions after each step, clamped per step into `limits`.
    pub fn positions(&self, limits: &TravelLimits) -> Vec<f64> {
        let mut position = limits.clamp(self.initial_position_mm);
        (0..self.step_count)
            .map(|_| {
                position = limits.clamp(position + self.step_size_mm);
                position
            })
            .collect()
    }

    /// Position after the last step.
    pub fn final_position(&self, limits: &TravelLimits) -> f64 {
        self.positions(limits)
            .last()
            .copied()
            .unwrap_or_else(|| limits.clamp(self.initial_position_mm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_final_position() {
        let plan = ScanPlan::default();
        let limits = TravelLimits::new(25.0);
        assert_eq!(plan.positions(&limits).len(), 31);
        assert!((plan.final_position(&limits) - 31.0 * 0.0008).abs() < 1e-9);
    }

    #[test]
    fn test_overrun_saturates_at_limit() {
        let plan = ScanPlan {
            step_size_mm: 1.0,
            step_count: 5,
            initial_position_mm: 23.5,
            ..ScanPlan::default()
        };
        let limits = TravelLimits::new(25.0);
        assert_eq!(plan.positions(&limits), vec![24.5, 25.0, 25.0, 25.0, 25.0]);
    }

    #[test]
    fn test_empty_plan_stays_at_start() {
        let plan = ScanPlan {
            step_count: 0,
            initial_position_mm: 3.0,
            ..ScanPlan::default()
        };
        assert_eq!(plan.final_position(&TravelLimits::new(25.0)), 3.0);
    }
}
