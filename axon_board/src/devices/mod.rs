//! Devices reached over the shared bus.
//!
//! - [`gate_driver`] - three-phase gate driver with a 16-bit register protocol
//! - [`encoder`] - position sensor, optionally an absolute SPI encoder
//! - [`motor`] - one power stage: gate driver, PWM counter and arming state
//!
//! Every device routes its transfers through a [`SharedBus`](crate::bus::SharedBus)
//! and never touches the bus peripheral directly.

pub mod encoder;
pub mod gate_driver;
pub mod motor;

pub use encoder::{decode_ams_frame, AmsFrameError, Encoder, EncoderStats, AMS_READ_ANGLE};
pub use gate_driver::{GateDriver, GateDriverRegister};
pub use motor::Motor;

use crate::bus::BusError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by bus devices.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// Bus transfer failed or timed out.
    #[error("Bus error on {device}: {source}")]
    Bus {
        /// Device name.
        device: String,
        /// Underlying bus error.
        #[source]
        source: BusError,
    },

    /// Device reports a fault condition.
    #[error("{device} reports fault (status {status:#06x})")]
    Fault {
        /// Device name.
        device: String,
        /// Raw status word.
        status: u16,
    },

    /// Register did not hold the value written to it.
    #[error("{device} register {register:?} read back {read:#05x}, wrote {wrote:#05x}")]
    Readback {
        /// Device name.
        device: String,
        /// Register that was verified.
        register: GateDriverRegister,
        /// Value written.
        wrote: u16,
        /// Value read back.
        read: u16,
    },

    /// Response frame failed its integrity check.
    #[error("{device} returned an invalid frame: {reason}")]
    InvalidFrame {
        /// Device name.
        device: String,
        /// What was wrong.
        reason: AmsFrameError,
    },

    /// Configuration block cannot be applied to this device.
    #[error("Invalid configuration for {device}: {reason}")]
    InvalidConfig {
        /// Device name.
        device: String,
        /// Rule that was violated.
        reason: String,
    },

    /// Operation requires a completed setup.
    #[error("{0} is not set up")]
    NotReady(String),
}

/// Hardware device taking part in boot-time setup.
///
/// # Lifecycle
///
/// 1. constructed during object construction, bus traffic not allowed yet
/// 2. `setup()` once during boot, after communication init
/// 3. steady-state use by the axis context
///
/// # Timing Contracts
///
/// | Operation | Max Duration | Context |
/// |-----------|--------------|---------|
/// | `setup()` | `timeout` per transfer | boot thread |
/// | completions | bounded, non-blocking | bus IRQ |
pub trait Device: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Configure the device and verify it responds correctly.
    ///
    /// Must succeed before the power stage is enabled. Each bus transfer
    /// waits at most `timeout`.
    fn setup(&self, timeout: Duration) -> Result<(), DeviceError>;
}
