//! Shared bus integration tests.
//!
//! Runs devices against the simulated SPI bus, whose completions arrive
//! from a separate interrupt thread like on the board.

use axon_board::bus::{
    BusArbiter, BusError, BusPeripheral, BusRequest, DeviceId, SharedBus, TransferCell,
    TransferListener, TransferStatus,
};
use axon_board::devices::gate_driver::GateDriverRegister;
use axon_board::devices::{Device, Encoder, GateDriver, Motor};
use axon_board::drivers::simulation::SimSpi;
use axon_common::blocks::{EncoderBlock, EncoderMode, MotorBlock};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(500);

/// Records completions in arrival order.
#[derive(Default)]
struct Journal {
    done: Mutex<Vec<(u8, TransferStatus)>>,
    changed: Condvar,
}

impl Journal {
    fn wait_for(&self, count: usize) -> Vec<(u8, TransferStatus)> {
        let mut done = self.done.lock();
        while done.len() < count {
            if self.changed.wait_for(&mut done, TIMEOUT).timed_out() {
                break;
            }
        }
        done.clone()
    }
}

struct Tagged {
    tag: u8,
    journal: Arc<Journal>,
}

impl TransferListener for Tagged {
    fn on_transfer_complete(&self, status: TransferStatus, _rx: &[u8]) {
        self.journal.done.lock().push((self.tag, status));
        self.journal.changed.notify_all();
    }
}

fn request(device: u8, tag: u8, journal: &Arc<Journal>) -> BusRequest {
    let listener = Arc::new(Tagged {
        tag,
        journal: journal.clone(),
    });
    BusRequest::new(DeviceId(device), &[0xFF, 0xFF], listener).unwrap()
}

fn spi_encoder_block() -> EncoderBlock {
    EncoderBlock {
        mode: EncoderMode::SpiAbsoluteAms,
        cpr: 1 << 14,
        ..EncoderBlock::default()
    }
}

#[test]
fn requests_complete_in_fifo_order() {
    let spi = SimSpi::start().unwrap();
    spi.set_latency(Duration::from_millis(5));
    let bus = spi.arbiter();
    let journal = Arc::new(Journal::default());

    bus.acquire(request(1, b'A', &journal)).unwrap();
    bus.acquire(request(2, b'B', &journal)).unwrap();
    bus.acquire(request(3, b'C', &journal)).unwrap();

    let done = journal.wait_for(3);
    let order: Vec<u8> = done.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(order, vec![b'A', b'B', b'C']);
    assert_eq!(spi.transfers(), vec![DeviceId(1), DeviceId(2), DeviceId(3)]);
    assert_eq!(bus.stats().completed(), 3);
    assert!(bus.stats().max_queue_len() >= 1);
}

#[test]
fn failed_transfer_does_not_stall_queue() {
    let spi = SimSpi::start().unwrap();
    spi.fail_device(DeviceId(2));
    let bus = spi.arbiter();
    let journal = Arc::new(Journal::default());

    bus.acquire(request(2, 1, &journal)).unwrap();
    bus.acquire(request(4, 2, &journal)).unwrap();

    let done = journal.wait_for(2);
    assert_eq!(
        done,
        vec![(1, TransferStatus::Error), (2, TransferStatus::Success)]
    );
    assert_eq!(bus.counters().failed, 1);
}

#[test]
fn blocking_transfer_returns_response() {
    let spi = SimSpi::start().unwrap();
    spi.set_angle(0x0123);
    let bus = spi.arbiter();
    let cell = TransferCell::new();

    let rx = cell
        .transfer_blocking(bus.as_ref(), DeviceId(1), &[0xFF, 0xFF], TIMEOUT)
        .unwrap();
    assert_eq!(u16::from_be_bytes([rx[0], rx[1]]) & 0x3FFF, 0x0123);

    spi.fail_device(DeviceId(5));
    let err = cell
        .transfer_blocking(bus.as_ref(), DeviceId(5), &[0, 0], TIMEOUT)
        .unwrap_err();
    assert_eq!(err, BusError::TransferFailed(DeviceId(5)));
}

#[test]
fn gate_driver_setup_writes_selected_gain() {
    let spi = SimSpi::start().unwrap();
    let device = DeviceId(0x10);
    spi.add_gate_driver(device);
    let bus: Arc<dyn SharedBus> = spi.arbiter();

    let motor = Motor::new(
        "axis0.motor",
        GateDriver::new("axis0.gate_driver", bus, device),
        MotorBlock::default(),
    );
    motor.apply_config(MotorBlock::default()).unwrap();
    motor.setup(TIMEOUT).unwrap();

    assert!(motor.is_ready());
    assert_eq!(
        spi.gate_register(device, GateDriverRegister::Control2),
        Some(motor.gate_driver().control2_value())
    );
}

#[test]
fn gate_driver_fault_fails_setup() {
    let spi = SimSpi::start().unwrap();
    let device = DeviceId(0x11);
    spi.add_gate_driver(device);
    spi.inject_gate_fault(device);

    let driver = GateDriver::new("axis1.gate_driver", spi.arbiter(), device);
    let err = driver.setup(TIMEOUT).unwrap_err();
    assert!(err.to_string().contains("fault"), "{err}");
}

#[test]
fn encoder_reads_do_not_stack() {
    let spi = SimSpi::start().unwrap();
    spi.set_latency(Duration::from_millis(20));
    spi.set_angle(4242);
    let encoder = Encoder::new("axis0.encoder", spi.arbiter(), DeviceId(1), spi_encoder_block());

    assert!(encoder.issue_transfer().unwrap());
    assert!(!encoder.issue_transfer().unwrap());
    assert_eq!(encoder.stats().skipped(), 1);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(encoder.angle(), Some(4242));
    assert_eq!(encoder.stats().reads(), 1);
}

#[test]
fn encoder_bus_error_is_counted_not_retried() {
    let spi = SimSpi::start().unwrap();
    spi.fail_device(DeviceId(2));
    let encoder = Encoder::new("axis1.encoder", spi.arbiter(), DeviceId(2), spi_encoder_block());

    assert!(encoder.issue_transfer().unwrap());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(encoder.stats().errors(), 1);
    assert_eq!(encoder.angle(), None);
    assert_eq!(spi.transfers(), vec![DeviceId(2)]);
}

/// Peripheral that flags any transfer started while another is on the wire.
struct OverlapCheckingBus {
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<u8>>>,
    irq: mpsc::Sender<u8>,
}

impl BusPeripheral for OverlapCheckingBus {
    fn begin_transfer(&mut self, device: DeviceId, _tx: &[u8]) -> Result<(), BusError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.started.lock().push(device.0);
        self.irq.send(device.0).map_err(|_| BusError::Peripheral {
            device,
            reason: "irq line closed".to_string(),
        })
    }
}

#[test]
fn concurrent_requests_are_serialized_in_acceptance_order() {
    const DEVICES: u8 = 8;

    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    let (irq, irq_rx) = mpsc::channel();
    let arbiter = Arc::new(BusArbiter::new(OverlapCheckingBus {
        in_flight: in_flight.clone(),
        overlaps: overlaps.clone(),
        started: started.clone(),
        irq,
    }));

    // Completion "interrupt": finishes each transfer after a short delay.
    let completer = {
        let arbiter = arbiter.clone();
        let in_flight = in_flight.clone();
        thread::spawn(move || {
            for _ in 0..DEVICES {
                let Ok(device) = irq_rx.recv_timeout(TIMEOUT) else {
                    return;
                };
                thread::sleep(Duration::from_micros(300));
                in_flight.store(false, Ordering::SeqCst);
                arbiter.on_complete(Ok(&[device, device][..]));
            }
        })
    };

    let journal = Arc::new(Journal::default());
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let callers: Vec<_> = (1..=DEVICES)
        .map(|device| {
            let arbiter = arbiter.clone();
            let journal = journal.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                let mut accepted = accepted.lock();
                arbiter.acquire(request(device, device, &journal)).unwrap();
                accepted.push(device);
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    let done = journal.wait_for(DEVICES as usize);
    completer.join().unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(done.len(), DEVICES as usize);
    let mut completed: Vec<u8> = done.iter().map(|(tag, _)| *tag).collect();
    assert!(done.iter().all(|(_, status)| *status == TransferStatus::Success));

    let accepted = accepted.lock().clone();
    assert_eq!(*started.lock(), accepted);
    assert_eq!(completed, accepted);
    completed.sort_unstable();
    assert_eq!(completed, (1..=DEVICES).collect::<Vec<_>>());
    assert_eq!(arbiter.stats().completed(), u32::from(DEVICES));
}
