//! Control-side objects owned by an axis.
//!
//! Control laws, estimation and trajectory planning run elsewhere; these
//! types hold their configuration and the state shared with the board.
//! Each keeps a handle to its axis' [`AxisStatus`] for status reporting
//! only.

use super::{AxisErrors, AxisStatus};
use axon_common::blocks::{ControllerBlock, EndstopBlock, SensorlessBlock, TrapTrajBlock};
use axon_common::consts::AXIS_COUNT;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Position/velocity/torque controller.
pub struct Controller {
    config: Mutex<ControllerBlock>,
    status: Arc<AxisStatus>,
}

impl Controller {
    /// Create the controller.
    pub fn new(config: ControllerBlock, status: Arc<AxisStatus>) -> Self {
        Self {
            config: Mutex::new(config),
            status,
        }
    }

    /// Check a controller block.
    pub fn check_config(config: &ControllerBlock) -> Result<(), String> {
        if !(config.vel_limit > 0.0) {
            return Err(format!("vel_limit {} must be positive", config.vel_limit));
        }
        if config.load_encoder_axis as usize >= AXIS_COUNT {
            return Err(format!(
                "load_encoder_axis {} does not exist",
                config.load_encoder_axis
            ));
        }
        Ok(())
    }

    /// Install a configuration block.
    pub fn apply_config(&self, config: ControllerBlock) {
        *self.config.lock() = config;
    }

    /// Active configuration.
    pub fn config(&self) -> ControllerBlock {
        self.config.lock().clone()
    }

    /// Flag a controller failure on the axis.
    pub fn report_failure(&self) {
        self.status.raise(AxisErrors::CONTROLLER_FAILED);
    }
}

/// Sensorless position estimator.
pub struct SensorlessEstimator {
    config: Mutex<SensorlessBlock>,
}

impl SensorlessEstimator {
    /// Create the estimator.
    pub fn new(config: SensorlessBlock) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Check an estimator block.
    pub fn check_config(config: &SensorlessBlock) -> Result<(), String> {
        if !(config.pm_flux_linkage > 0.0) {
            return Err("pm_flux_linkage must be positive".to_string());
        }
        Ok(())
    }

    /// Install a configuration block.
    pub fn apply_config(&self, config: SensorlessBlock) {
        *self.config.lock() = config;
    }

    /// Active configuration.
    pub fn config(&self) -> SensorlessBlock {
        self.config.lock().clone()
    }
}

/// Trapezoidal trajectory planner.
pub struct TrapezoidalTrajectory {
    config: Mutex<TrapTrajBlock>,
}

impl TrapezoidalTrajectory {
    /// Create the planner.
    pub fn new(config: TrapTrajBlock) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Check a planner block.
    pub fn check_config(config: &TrapTrajBlock) -> Result<(), String> {
        if !(config.accel_limit > 0.0 && config.decel_limit > 0.0) {
            return Err("accel_limit and decel_limit must be positive".to_string());
        }
        Ok(())
    }

    /// Install a configuration block.
    pub fn apply_config(&self, config: TrapTrajBlock) {
        *self.config.lock() = config;
    }

    /// Active configuration.
    pub fn config(&self) -> TrapTrajBlock {
        self.config.lock().clone()
    }
}

/// Which end of travel a switch guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndstopSide {
    /// Minimum position switch.
    Min,
    /// Maximum position switch.
    Max,
}

/// Limit switch input.
pub struct Endstop {
    side: EndstopSide,
    config: Mutex<EndstopBlock>,
    pressed: AtomicBool,
    status: Arc<AxisStatus>,
}

impl Endstop {
    /// Create the endstop.
    pub fn new(side: EndstopSide, config: EndstopBlock, status: Arc<AxisStatus>) -> Self {
        Self {
            side,
            config: Mutex::new(config),
            pressed: AtomicBool::new(false),
            status,
        }
    }

    /// Install a configuration block.
    pub fn apply_config(&self, config: EndstopBlock) {
        *self.config.lock() = config;
    }

    /// Active configuration.
    pub fn config(&self) -> EndstopBlock {
        self.config.lock().clone()
    }

    /// Feed the debounced pin level. Disabled switches never report.
    pub fn update(&self, level: bool) {
        let (enabled, active_high) = {
            let config = self.config.lock();
            (config.enabled, config.is_active_high)
        };
        let pressed = enabled && level == active_high;
        self.pressed.store(pressed, Ordering::Release);
        let flag = match self.side {
            EndstopSide::Min => AxisErrors::MIN_ENDSTOP_PRESSED,
            EndstopSide::Max => AxisErrors::MAX_ENDSTOP_PRESSED,
        };
        if pressed {
            self.status.raise(flag);
        }
    }

    /// Whether the switch is pressed.
    pub fn is_pressed(&self) -> bool {
        self.pressed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endstop_polarity_and_enable() {
        let status = Arc::new(AxisStatus::new(0));
        let endstop = Endstop::new(EndstopSide::Max, EndstopBlock::default(), status.clone());

        endstop.update(false);
        assert!(!endstop.is_pressed(), "disabled switch never reports");

        endstop.apply_config(EndstopBlock {
            enabled: true,
            is_active_high: false,
            ..EndstopBlock::default()
        });
        endstop.update(true);
        assert!(!endstop.is_pressed());
        endstop.update(false);
        assert!(endstop.is_pressed());
        assert!(status.errors().contains(AxisErrors::MAX_ENDSTOP_PRESSED));
    }

    #[test]
    fn controller_rejects_missing_load_encoder() {
        let config = ControllerBlock {
            load_encoder_axis: AXIS_COUNT as u8,
            ..ControllerBlock::default()
        };
        assert!(Controller::check_config(&config).is_err());
        assert!(Controller::check_config(&ControllerBlock::default()).is_ok());
    }
}
