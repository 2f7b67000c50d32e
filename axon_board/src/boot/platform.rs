//! Board hardware boundary used by the boot sequence.

use super::BoardContext;
use crate::bus::{DeviceId, SharedBus};
use crate::safety::PowerStage;
use crate::timer::{StartTrigger, SyncCounter};
use axon_common::blocks::CanBlock;
use axon_common::consts::TIMER_GROUP_SIZE;
use axon_common::hw::HwVersion;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Hardware-level failure reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {reason}")]
pub struct PlatformError {
    /// Platform operation.
    pub operation: &'static str,
    /// Platform message.
    pub reason: String,
}

impl PlatformError {
    /// Create an error for `operation`.
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// Interface on the shared CAN/I2C pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommBus {
    /// I2C slave at the given 7-bit address.
    I2c {
        /// Slave address.
        address: u8,
    },
    /// CAN controller.
    Can,
}

/// Peripheral setup derived from the loaded configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralPlan {
    /// UART baud rate, `None` when disabled.
    pub uart_baudrate: Option<u32>,
    /// Interface on the shared CAN/I2C pins.
    pub comm: CommBus,
    /// CAN settings, used when `comm` is CAN.
    pub can: CanBlock,
}

/// The board as seen by [`BootOrchestrator`](super::BootOrchestrator).
///
/// # Lifecycle
///
/// Called from the boot thread in this order: `init_low_level`,
/// `take_counters`/`start_trigger`, `read_i2c_strap_pins`,
/// `init_peripherals`, `init_communication`, `power_stage().enable()`,
/// `spawn_analog_sampling`.
pub trait Platform: Send {
    /// Counter type of the synchronized group.
    type Counter: SyncCounter + 'static;

    /// Hardware revision.
    fn hw_version(&self) -> HwVersion;

    /// Clocks, GPIO banks and counters. Must be idempotent.
    fn init_low_level(&mut self);

    /// Hand over the counter group: axis 0 PWM, axis 1 PWM, sampling.
    /// Returns `None` once the group has been taken.
    fn take_counters(&mut self) -> Option<[Self::Counter; TIMER_GROUP_SIZE]>;

    /// Shared start trigger of the counter group.
    fn start_trigger(&self) -> &dyn StartTrigger;

    /// Levels of the I2C address strap pins (bit 0 = A0).
    fn read_i2c_strap_pins(&self) -> u8;

    /// Bring up the communication peripherals.
    fn init_peripherals(&mut self, plan: &PeripheralPlan) -> Result<(), PlatformError>;

    /// The arbitrated SPI bus.
    fn shared_bus(&self) -> Arc<dyn SharedBus>;

    /// Chip select of the gate driver of `axis`.
    fn gate_driver_device(&self, axis: usize) -> DeviceId;

    /// Start the communication layer. Axis objects exist at this point.
    fn init_communication(&mut self, ctx: &Arc<BoardContext>) -> Result<(), PlatformError>;

    /// PWM outputs, brake resistor and halt.
    fn power_stage(&self) -> Arc<dyn PowerStage>;

    /// Start the analog sampling context.
    fn spawn_analog_sampling(&mut self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>>;

    /// Bounded delay during boot.
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
