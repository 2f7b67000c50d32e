//! Three-phase gate driver on the shared bus.
//!
//! Frames are 16 bits, sent MSB first:
//!
//! ```text
//!  15   14..11   10..0
//! ┌───┬────────┬────────┐
//! │R/W│  addr  │  data  │   R/W = 1 for read
//! └───┴────────┴────────┘
//! ```
//!
//! The response to frame N is clocked out during frame N+1, so reading a
//! register takes two transfers.

use super::{Device, DeviceError};
use crate::bus::{BusError, DeviceId, SharedBus, TransferCell};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Register map of the gate driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GateDriverRegister {
    /// Fault flags (read only).
    Status1 = 0x0,
    /// Device id and secondary flags (read only).
    Status2 = 0x1,
    /// Gate drive and overcurrent configuration.
    Control1 = 0x2,
    /// Current-sense amplifier configuration.
    Control2 = 0x3,
}

/// Set in `Status1` while any fault is latched.
pub const STATUS1_FAULT: u16 = 1 << 10;

const READ_BIT: u16 = 1 << 15;
const DATA_MASK: u16 = 0x07FF;

/// Gate current 1.7 A, 6-PWM mode, overcurrent latch, OC_ADJ code 21.
pub const CONTROL1_DEFAULT: u16 = (21 << 6) | (0b01 << 4);

/// Amplifier gain code position in `Control2`.
const CONTROL2_GAIN_SHIFT: u16 = 2;

/// Available amplifier gains [V/V], indexed by gain code.
pub const AMPLIFIER_GAINS: [f32; 4] = [10.0, 20.0, 40.0, 80.0];

/// Current shunt value [Ohm].
pub const SHUNT_RESISTANCE: f32 = 0.0005;

/// Usable amplifier output swing either side of mid-rail [V].
pub const AMPLIFIER_SWING: f32 = 1.35;

/// Build a bus frame.
pub const fn encode_frame(read: bool, register: GateDriverRegister, data: u16) -> u16 {
    let rw = if read { READ_BIT } else { 0 };
    rw | ((register as u16 & 0xF) << 11) | (data & DATA_MASK)
}

/// Measurable current range [A] for a gain code.
pub fn current_range_for_gain(code: usize) -> f32 {
    AMPLIFIER_SWING / (SHUNT_RESISTANCE * AMPLIFIER_GAINS[code])
}

/// Highest gain code whose range still covers `requested` amps.
pub fn gain_code_for(requested: f32) -> Option<usize> {
    if !(requested > 0.0) {
        return None;
    }
    (0..AMPLIFIER_GAINS.len())
        .rev()
        .find(|&code| current_range_for_gain(code) >= requested)
}

/// Gate driver of one axis.
pub struct GateDriver {
    name: String,
    bus: Arc<dyn SharedBus>,
    device: DeviceId,
    mailbox: Arc<TransferCell>,
    /// Amplifier gain code chosen when the motor config was applied.
    gain_code: Mutex<usize>,
}

impl GateDriver {
    /// Create a driver for the chip on `device`.
    pub fn new(name: impl Into<String>, bus: Arc<dyn SharedBus>, device: DeviceId) -> Self {
        Self {
            name: name.into(),
            bus,
            device,
            mailbox: TransferCell::new(),
            gain_code: Mutex::new(0),
        }
    }

    /// Chip-select line.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Pick the highest gain whose range still covers `requested` amps.
    ///
    /// Returns the actual measurable range. The gain is written to the
    /// chip by the next [`setup`](Device::setup).
    pub fn select_gain(&self, requested: f32) -> Result<f32, DeviceError> {
        let code = gain_code_for(requested).ok_or_else(|| DeviceError::InvalidConfig {
            device: self.name.clone(),
            reason: format!(
                "requested current range {} A outside (0, {}] A",
                requested,
                current_range_for_gain(0)
            ),
        })?;
        *self.gain_code.lock() = code;
        let range = current_range_for_gain(code);
        debug!(
            "{}: gain {} V/V for {} A (range {} A)",
            self.name, AMPLIFIER_GAINS[code], requested, range
        );
        Ok(range)
    }

    /// `Control2` value for the selected gain.
    pub fn control2_value(&self) -> u16 {
        (*self.gain_code.lock() as u16) << CONTROL2_GAIN_SHIFT
    }

    /// Read `Status1` and fail if a fault is latched.
    pub fn check_fault(&self, timeout: Duration) -> Result<(), DeviceError> {
        let status = self.read_register(GateDriverRegister::Status1, timeout)?;
        if status & STATUS1_FAULT != 0 {
            return Err(DeviceError::Fault {
                device: self.name.clone(),
                status,
            });
        }
        Ok(())
    }

    fn transact(&self, word: u16, timeout: Duration) -> Result<u16, DeviceError> {
        let rx = self
            .mailbox
            .transfer_blocking(self.bus.as_ref(), self.device, &word.to_be_bytes(), timeout)
            .map_err(|source| self.bus_error(source))?;
        match rx.as_slice() {
            [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(self.bus_error(BusError::TransferFailed(self.device))),
        }
    }

    fn write_register(
        &self,
        register: GateDriverRegister,
        value: u16,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        self.transact(encode_frame(false, register, value), timeout)?;
        Ok(())
    }

    fn read_register(
        &self,
        register: GateDriverRegister,
        timeout: Duration,
    ) -> Result<u16, DeviceError> {
        self.transact(encode_frame(true, register, 0), timeout)?;
        let response = self.transact(encode_frame(true, GateDriverRegister::Status1, 0), timeout)?;
        Ok(response & DATA_MASK)
    }

    fn verify_register(
        &self,
        register: GateDriverRegister,
        wrote: u16,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let read = self.read_register(register, timeout)?;
        if read != wrote & DATA_MASK {
            return Err(DeviceError::Readback {
                device: self.name.clone(),
                register,
                wrote,
                read,
            });
        }
        Ok(())
    }

    fn bus_error(&self, source: BusError) -> DeviceError {
        DeviceError::Bus {
            device: self.name.clone(),
            source,
        }
    }
}

impl Device for GateDriver {
    fn name(&self) -> &str {
        &self.name
    }

    /// Write both control registers, read them back, then check for faults.
    fn setup(&self, timeout: Duration) -> Result<(), DeviceError> {
        let control2 = self.control2_value();
        self.write_register(GateDriverRegister::Control1, CONTROL1_DEFAULT, timeout)?;
        self.write_register(GateDriverRegister::Control2, control2, timeout)?;
        self.verify_register(GateDriverRegister::Control1, CONTROL1_DEFAULT, timeout)?;
        self.verify_register(GateDriverRegister::Control2, control2, timeout)?;
        self.check_fault(timeout)?;
        info!("{} configured (control2 {:#05x})", self.name, control2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        assert_eq!(encode_frame(true, GateDriverRegister::Status1, 0), 0x8000);
        assert_eq!(
            encode_frame(false, GateDriverRegister::Control2, 0x7FF),
            (0x3 << 11) | 0x7FF
        );
        // Data beyond 11 bits never leaks into the address field.
        assert_eq!(encode_frame(false, GateDriverRegister::Status1, 0xFFFF), 0x07FF);
    }

    #[test]
    fn gain_ranges_decrease_with_gain() {
        assert!((current_range_for_gain(0) - 270.0).abs() < 0.01);
        assert!((current_range_for_gain(3) - 33.75).abs() < 0.01);
    }

    #[test]
    fn gain_selection_keeps_requested_range() {
        assert_eq!(gain_code_for(60.0), Some(2));
        assert_eq!(gain_code_for(30.0), Some(3));
        assert_eq!(gain_code_for(250.0), Some(0));
        assert_eq!(gain_code_for(500.0), None);
        assert_eq!(gain_code_for(0.0), None);
    }
}
