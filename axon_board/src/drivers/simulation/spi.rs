//! Simulated SPI bus.
//!
//! [`SimSpiBus`] is the peripheral behind the arbiter. Each started
//! transfer is handed to a background "interrupt" thread, which answers
//! it from the device models and then calls
//! [`BusArbiter::on_complete`], exactly like the hardware completion IRQ.
//!
//! Chip selects at [`SIM_GATE_DRIVER_BASE`] and up are gate drivers.
//! Every other chip select answers as an absolute SPI encoder.

use crate::bus::{BusArbiter, BusError, BusPeripheral, DeviceId, Frame};
use crate::devices::gate_driver::{GateDriverRegister, STATUS1_FAULT};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// First chip select of the simulated gate drivers (axis 0).
pub const SIM_GATE_DRIVER_BASE: u8 = 0x10;

const READ_BIT: u16 = 1 << 15;
const DATA_MASK: u16 = 0x7FF;
const AMS_ANGLE_MASK: u16 = 0x3FFF;

/// Register file of one gate driver.
#[derive(Debug, Default)]
struct GateDriverModel {
    registers: [u16; 4],
    fault: bool,
    /// Answer clocked out with the next frame.
    response: u16,
}

impl GateDriverModel {
    fn register(&self, index: usize) -> u16 {
        if index == GateDriverRegister::Status1 as usize {
            if self.fault { STATUS1_FAULT } else { 0 }
        } else {
            self.registers.get(index).copied().unwrap_or(0)
        }
    }

    fn exchange(&mut self, word: u16) -> u16 {
        let out = self.response;
        let index = ((word >> 11) & 0xF) as usize;
        if word & READ_BIT != 0 {
            self.response = self.register(index);
        } else {
            if index == GateDriverRegister::Control1 as usize
                || index == GateDriverRegister::Control2 as usize
            {
                self.registers[index] = word & DATA_MASK;
            }
            self.response = self.register(GateDriverRegister::Status1 as usize);
        }
        out
    }
}

#[derive(Debug, Default)]
struct BusModel {
    gate_drivers: BTreeMap<DeviceId, GateDriverModel>,
    failing: BTreeSet<DeviceId>,
    angle: u16,
    transfers: Vec<DeviceId>,
    latency: Duration,
}

impl BusModel {
    fn answer(&mut self, device: DeviceId, tx: &[u8]) -> Result<Frame, BusError> {
        self.transfers.push(device);
        if self.failing.contains(&device) {
            return Err(BusError::TransferFailed(device));
        }
        let word = match tx {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            _ => {
                return Err(BusError::Peripheral {
                    device,
                    reason: format!("{}-byte frame", tx.len()),
                })
            }
        };
        let reply = match self.gate_drivers.get_mut(&device) {
            Some(model) => model.exchange(word),
            None => {
                let angle = self.angle & AMS_ANGLE_MASK;
                if angle.count_ones() % 2 == 0 { angle } else { angle | 0x8000 }
            }
        };
        let mut rx = Frame::new();
        rx.extend_from_slice(&reply.to_be_bytes())
            .map_err(|_| BusError::FrameTooLong(2))?;
        Ok(rx)
    }
}

struct Job {
    device: DeviceId,
    tx: Frame,
}

/// Bus peripheral of the simulated board.
pub struct SimSpiBus {
    irq: Sender<Job>,
}

impl BusPeripheral for SimSpiBus {
    fn begin_transfer(&mut self, device: DeviceId, tx: &[u8]) -> Result<(), BusError> {
        let mut frame = Frame::new();
        frame
            .extend_from_slice(tx)
            .map_err(|_| BusError::FrameTooLong(tx.len()))?;
        self.irq
            .send(Job { device, tx: frame })
            .map_err(|_| BusError::Peripheral {
                device,
                reason: "completion interrupt stopped".to_string(),
            })
    }
}

/// Simulated bus with its arbiter and device models.
#[derive(Clone)]
pub struct SimSpi {
    arbiter: Arc<BusArbiter<SimSpiBus>>,
    model: Arc<Mutex<BusModel>>,
}

impl SimSpi {
    /// Start the bus and its completion thread.
    ///
    /// The thread ends once the arbiter is dropped.
    pub fn start() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let arbiter = Arc::new(BusArbiter::new(SimSpiBus { irq: tx }));
        let model = Arc::new(Mutex::new(BusModel::default()));

        let weak = Arc::downgrade(&arbiter);
        let irq_model = model.clone();
        thread::Builder::new()
            .name("spi_irq".to_string())
            .spawn(move || completion_loop(rx, weak, irq_model))?;
        debug!("Simulated SPI bus started");
        Ok(Self { arbiter, model })
    }

    /// The arbiter in front of the bus.
    pub fn arbiter(&self) -> Arc<BusArbiter<SimSpiBus>> {
        self.arbiter.clone()
    }

    /// Attach a gate driver model on `device`.
    pub fn add_gate_driver(&self, device: DeviceId) {
        self.model
            .lock()
            .gate_drivers
            .insert(device, GateDriverModel::default());
    }

    /// Latch a fault in the gate driver on `device`.
    pub fn inject_gate_fault(&self, device: DeviceId) {
        if let Some(model) = self.model.lock().gate_drivers.get_mut(&device) {
            model.fault = true;
        }
    }

    /// Make every transfer to `device` fail.
    pub fn fail_device(&self, device: DeviceId) {
        self.model.lock().failing.insert(device);
    }

    /// Angle reported by every encoder.
    pub fn set_angle(&self, angle: u16) {
        self.model.lock().angle = angle;
    }

    /// Delay between start and completion of each transfer.
    pub fn set_latency(&self, latency: Duration) {
        self.model.lock().latency = latency;
    }

    /// Register value of the gate driver on `device`.
    pub fn gate_register(&self, device: DeviceId, register: GateDriverRegister) -> Option<u16> {
        self.model
            .lock()
            .gate_drivers
            .get(&device)
            .map(|model| model.register(register as usize))
    }

    /// Devices in the order their transfers reached the wire.
    pub fn transfers(&self) -> Vec<DeviceId> {
        self.model.lock().transfers.clone()
    }
}

fn completion_loop(jobs: Receiver<Job>, arbiter: Weak<BusArbiter<SimSpiBus>>, model: Arc<Mutex<BusModel>>) {
    while let Ok(job) = jobs.recv() {
        let latency = model.lock().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let outcome = model.lock().answer(job.device, &job.tx);
        let Some(arbiter) = arbiter.upgrade() else {
            break;
        };
        trace!("SPI completion for {}", job.device);
        match outcome {
            Ok(rx) => arbiter.on_complete(Ok(&rx)),
            Err(e) => arbiter.on_complete(Err(e)),
        }
    }
    debug!("Simulated SPI completion thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::gate_driver::encode_frame;

    #[test]
    fn gate_driver_answers_in_next_frame() {
        let mut model = GateDriverModel::default();
        model.exchange(encode_frame(false, GateDriverRegister::Control2, 0x0C));
        model.exchange(encode_frame(true, GateDriverRegister::Control2, 0));
        let answer = model.exchange(encode_frame(true, GateDriverRegister::Status1, 0));
        assert_eq!(answer, 0x0C);
    }

    #[test]
    fn fault_shows_in_status() {
        let mut model = GateDriverModel {
            fault: true,
            ..GateDriverModel::default()
        };
        model.exchange(encode_frame(true, GateDriverRegister::Status1, 0));
        let answer = model.exchange(encode_frame(true, GateDriverRegister::Status1, 0));
        assert_eq!(answer & STATUS1_FAULT, STATUS1_FAULT);
    }

    #[test]
    fn encoder_frames_have_even_parity() {
        let mut model = BusModel {
            angle: 0x0001,
            ..BusModel::default()
        };
        let rx = model.answer(DeviceId(1), &[0xFF, 0xFF]).unwrap();
        let word = u16::from_be_bytes([rx[0], rx[1]]);
        assert_eq!(word.count_ones() % 2, 0);
        assert_eq!(word & AMS_ANGLE_MASK, 1);
    }

    #[test]
    fn failing_device_is_recorded() {
        let mut model = BusModel::default();
        model.failing.insert(DeviceId(3));
        assert_eq!(
            model.answer(DeviceId(3), &[0, 0]),
            Err(BusError::TransferFailed(DeviceId(3)))
        );
        assert_eq!(model.transfers, vec![DeviceId(3)]);
    }
}
