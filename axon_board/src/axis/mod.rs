//! Axis assembly: one motor channel and everything bound to it.
//!
//! An [`Axis`] owns exactly one motor, encoder, controller, sensorless
//! estimator, trajectory planner and two endstops. Axes are built once
//! during boot and live until the process ends.
//!
//! ```text
//!                 ┌──────────────── Axis ────────────────┐
//!                 │ Motor ── GateDriver ──┐              │
//!                 │ Encoder ──────────────┼─▶ SharedBus  │
//!                 │ Controller  Sensorless  TrapTraj     │
//!                 │ Endstop(min)  Endstop(max)           │
//!                 │        │ status only                 │
//!                 │        ▼                             │
//!                 │   Arc<AxisStatus>                    │
//!                 └──────────────────────────────────────┘
//! ```

mod components;
mod worker;

pub use components::{Controller, Endstop, EndstopSide, SensorlessEstimator, TrapezoidalTrajectory};
pub use worker::{AxisLoop, IdleLoop};

use crate::devices::gate_driver::gain_code_for;
use crate::devices::{Device, DeviceError, Encoder, Motor};
use axon_common::blocks::AxisBlock;
use axon_common::hw::AxisHwConfig;
use axon_common::layout::AxisConfigSet;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

bitflags! {
    /// Error and event flags of one axis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AxisErrors: u32 {
        /// Motor or gate driver failure.
        const MOTOR_FAILED        = 0x0001;
        /// Encoder failure.
        const ENCODER_FAILED      = 0x0002;
        /// Controller failure.
        const CONTROLLER_FAILED   = 0x0004;
        /// Minimum endstop pressed.
        const MIN_ENDSTOP_PRESSED = 0x0008;
        /// Maximum endstop pressed.
        const MAX_ENDSTOP_PRESSED = 0x0010;
        /// Power output disarmed by the safety hook.
        const SAFETY_DISARMED     = 0x0020;
    }
}

/// Status shared between an axis and its sub-objects.
#[derive(Debug)]
pub struct AxisStatus {
    index: usize,
    errors: AtomicU32,
    heartbeat: AtomicU64,
    running: AtomicBool,
}

impl AxisStatus {
    /// Fresh status for axis `index`.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            errors: AtomicU32::new(0),
            heartbeat: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Axis index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Latch error flags.
    pub fn raise(&self, flags: AxisErrors) {
        self.errors.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Latched error flags.
    pub fn errors(&self) -> AxisErrors {
        AxisErrors::from_bits_truncate(self.errors.load(Ordering::Acquire))
    }

    /// Clear every latched flag.
    pub fn clear_errors(&self) {
        self.errors.store(0, Ordering::Release);
    }

    /// Count one iteration of the axis context.
    pub fn beat(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    /// Iterations of the axis context so far.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    /// Whether the axis context is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

/// One motor channel.
pub struct Axis {
    index: usize,
    hw: AxisHwConfig,
    status: Arc<AxisStatus>,
    motor: Motor,
    encoder: Encoder,
    sensorless: SensorlessEstimator,
    controller: Controller,
    trap_traj: TrapezoidalTrajectory,
    min_endstop: Endstop,
    max_endstop: Endstop,
    config: Mutex<AxisBlock>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Axis {
    /// Check every block of one axis without touching hardware.
    pub fn check_config(set: &AxisConfigSet) -> Result<(), String> {
        Motor::check_config(&set.motor).map_err(|e| format!("motor: {e}"))?;
        if gain_code_for(set.motor.requested_current_range).is_none() {
            return Err(format!(
                "motor: requested_current_range {} A not supported",
                set.motor.requested_current_range
            ));
        }
        Encoder::check_config(&set.encoder, &set.motor).map_err(|e| format!("encoder: {e}"))?;
        SensorlessEstimator::check_config(&set.sensorless)
            .map_err(|e| format!("sensorless: {e}"))?;
        Controller::check_config(&set.controller).map_err(|e| format!("controller: {e}"))?;
        TrapezoidalTrajectory::check_config(&set.trap_traj)
            .map_err(|e| format!("trap_traj: {e}"))?;
        Ok(())
    }

    /// Build the axis around its motor and encoder.
    ///
    /// Estimator, controller, trajectory planner and endstops are
    /// constructed here, in that order, then the configuration is applied.
    pub fn new(
        index: usize,
        hw: AxisHwConfig,
        motor: Motor,
        encoder: Encoder,
        set: &AxisConfigSet,
    ) -> Result<Arc<Self>, DeviceError> {
        let status = Arc::new(AxisStatus::new(index));
        let sensorless = SensorlessEstimator::new(set.sensorless.clone());
        let controller = Controller::new(set.controller.clone(), status.clone());
        let trap_traj = TrapezoidalTrajectory::new(set.trap_traj.clone());
        let min_endstop = Endstop::new(EndstopSide::Min, set.min_endstop.clone(), status.clone());
        let max_endstop = Endstop::new(EndstopSide::Max, set.max_endstop.clone(), status.clone());

        let axis = Self {
            index,
            hw,
            status,
            motor,
            encoder,
            sensorless,
            controller,
            trap_traj,
            min_endstop,
            max_endstop,
            config: Mutex::new(set.axis.clone()),
            worker: Mutex::new(None),
        };
        axis.apply_config(set)?;
        debug!("Axis {} constructed", index);
        Ok(Arc::new(axis))
    }

    /// Install every block of `set` into the sub-objects.
    pub fn apply_config(&self, set: &AxisConfigSet) -> Result<(), DeviceError> {
        self.motor.apply_config(set.motor.clone())?;
        self.encoder.apply_config(set.encoder.clone());
        self.sensorless.apply_config(set.sensorless.clone());
        self.controller.apply_config(set.controller.clone());
        self.trap_traj.apply_config(set.trap_traj.clone());
        self.min_endstop.apply_config(set.min_endstop.clone());
        self.max_endstop.apply_config(set.max_endstop.clone());
        *self.config.lock() = set.axis.clone();
        Ok(())
    }

    /// Current configuration of every sub-object.
    pub fn snapshot(&self) -> AxisConfigSet {
        AxisConfigSet {
            encoder: self.encoder.config(),
            sensorless: self.sensorless.config(),
            controller: self.controller.config(),
            trap_traj: self.trap_traj.config(),
            min_endstop: self.min_endstop.config(),
            max_endstop: self.max_endstop.config(),
            motor: self.motor.config(),
            axis: self.config.lock().clone(),
        }
    }

    /// Run hardware setup of the motor and encoder.
    pub fn setup(&self, timeout: Duration) -> Result<(), DeviceError> {
        if let Err(e) = self.motor.setup(timeout) {
            self.status.raise(AxisErrors::MOTOR_FAILED);
            return Err(e);
        }
        if let Err(e) = self.encoder.setup(timeout) {
            self.status.raise(AxisErrors::ENCODER_FAILED);
            return Err(e);
        }
        Ok(())
    }

    /// Axis index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fixed board wiring of this channel.
    pub fn hw(&self) -> &AxisHwConfig {
        &self.hw
    }

    /// Shared status.
    pub fn status(&self) -> &Arc<AxisStatus> {
        &self.status
    }

    /// Axis block.
    pub fn config(&self) -> AxisBlock {
        self.config.lock().clone()
    }

    /// Motor.
    pub fn motor(&self) -> &Motor {
        &self.motor
    }

    /// Encoder.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Sensorless estimator.
    pub fn sensorless(&self) -> &SensorlessEstimator {
        &self.sensorless
    }

    /// Controller.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Trajectory planner.
    pub fn trap_traj(&self) -> &TrapezoidalTrajectory {
        &self.trap_traj
    }

    /// Minimum endstop.
    pub fn min_endstop(&self) -> &Endstop {
        &self.min_endstop
    }

    /// Maximum endstop.
    pub fn max_endstop(&self) -> &Endstop {
        &self.max_endstop
    }
}
