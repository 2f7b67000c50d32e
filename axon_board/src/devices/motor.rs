//! One motor power stage.
//!
//! Owns the axis' gate driver and, once the counter group has started,
//! its PWM counter. Arming state is an atomic flag so the safety hook can
//! disarm from any context without taking a lock.

use super::gate_driver::GateDriver;
use super::{Device, DeviceError};
use crate::timer::SyncCounter;
use axon_common::blocks::{MotorBlock, MotorType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Power stage of one axis.
pub struct Motor {
    name: String,
    gate_driver: GateDriver,
    config: Mutex<MotorBlock>,
    pwm: Mutex<Option<Box<dyn SyncCounter>>>,
    current_range: Mutex<f32>,
    ready: AtomicBool,
    armed: AtomicBool,
}

impl Motor {
    /// Create the motor around its gate driver.
    pub fn new(name: impl Into<String>, gate_driver: GateDriver, config: MotorBlock) -> Self {
        Self {
            name: name.into(),
            gate_driver,
            config: Mutex::new(config),
            pwm: Mutex::new(None),
            current_range: Mutex::new(0.0),
            ready: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        }
    }

    /// Check a motor block without touching the hardware.
    pub fn check_config(config: &MotorBlock) -> Result<(), String> {
        if config.pole_pairs == 0 {
            return Err("pole_pairs must be positive".to_string());
        }
        if !(config.current_lim > 0.0) {
            return Err(format!("current_lim {} must be positive", config.current_lim));
        }
        if config.motor_type != MotorType::Gimbal && config.calibration_current > config.current_lim {
            return Err(format!(
                "calibration_current {} exceeds current_lim {}",
                config.calibration_current, config.current_lim
            ));
        }
        if config.pre_calibrated && !(config.phase_resistance > 0.0 && config.phase_inductance > 0.0)
        {
            return Err("pre_calibrated without measured phase resistance/inductance".to_string());
        }
        Ok(())
    }

    /// Validate and install a motor block and choose the amplifier gain.
    pub fn apply_config(&self, config: MotorBlock) -> Result<(), DeviceError> {
        Self::check_config(&config).map_err(|reason| DeviceError::InvalidConfig {
            device: self.name.clone(),
            reason,
        })?;
        let range = self.gate_driver.select_gain(config.requested_current_range)?;
        *self.current_range.lock() = range;
        *self.config.lock() = config;
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> MotorBlock {
        self.config.lock().clone()
    }

    /// Measurable phase current range after gain selection [A].
    pub fn current_range(&self) -> f32 {
        *self.current_range.lock()
    }

    /// Gate driver of this motor.
    pub fn gate_driver(&self) -> &GateDriver {
        &self.gate_driver
    }

    /// Take over the PWM counter once the counter group has started.
    pub fn attach_pwm(&self, counter: Box<dyn SyncCounter>) {
        debug!("{} takes over counter {}", self.name, counter.name());
        *self.pwm.lock() = Some(counter);
    }

    /// Current count of the attached PWM counter.
    pub fn pwm_count(&self) -> Option<u32> {
        self.pwm.lock().as_ref().map(|counter| counter.count())
    }

    /// Whether hardware setup completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Enable PWM output. Requires setup and an attached counter.
    pub fn arm(&self) -> Result<(), DeviceError> {
        if !self.is_ready() || self.pwm.lock().is_none() {
            return Err(DeviceError::NotReady(self.name.clone()));
        }
        self.armed.store(true, Ordering::Release);
        info!("{} armed", self.name);
        Ok(())
    }

    /// Disable PWM output.
    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            info!("{} disarmed", self.name);
        }
    }

    /// Disable PWM output from the safety path. Lock free, no logging.
    pub fn safety_critical_disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Whether PWM output is enabled.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl Device for Motor {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.ready.store(false, Ordering::Release);
        if let Err(e) = self.gate_driver.setup(timeout) {
            warn!("{} gate driver setup failed: {}", self.name, e);
            return Err(e);
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}
