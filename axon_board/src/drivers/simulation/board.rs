//! Simulated board platform.

use super::spi::{SimSpi, SIM_GATE_DRIVER_BASE};
use super::timer::{SimTimebase, SimTimer};
use crate::boot::{BoardContext, PeripheralPlan, Platform, PlatformError};
use crate::bus::{DeviceId, SharedBus};
use crate::safety::PowerStage;
use crate::system::ResourceProbe;
use crate::timer::StartTrigger;
use axon_common::config::BoardConfig;
use axon_common::consts::{TIM_1_8_PERIOD_CLOCKS, TIMER_GROUP_SIZE};
use axon_common::hw::HwVersion;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Ordered record of platform calls.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Period of the simulated analog sampling context.
const SAMPLING_PERIOD: Duration = Duration::from_millis(1);

/// Simulated PWM outputs and brake resistor.
#[derive(Debug)]
pub struct SimPowerStage {
    enabled: AtomicBool,
    brake_armed: AtomicBool,
    halted: AtomicBool,
    events: EventLog,
}

impl SimPowerStage {
    fn new(events: EventLog) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            brake_armed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            events,
        }
    }

    /// Whether the brake resistor is switched in.
    pub fn is_brake_armed(&self) -> bool {
        self.brake_armed.load(Ordering::Acquire)
    }

    /// Whether a context halted the processor.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

impl PowerStage for SimPowerStage {
    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        self.brake_armed.store(true, Ordering::Release);
        self.events.lock().push("power_stage.enable".to_string());
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn disarm_brake_resistor(&self) {
        self.brake_armed.store(false, Ordering::Release);
    }

    fn halt(&self) -> ! {
        self.enabled.store(false, Ordering::Release);
        self.halted.store(true, Ordering::Release);
        error!("Processor halted");
        loop {
            thread::park();
        }
    }
}

/// Settable memory headroom.
#[derive(Debug)]
pub struct SimResourceProbe {
    free: AtomicUsize,
}

impl SimResourceProbe {
    /// Probe reporting `free` bytes.
    pub fn new(free: usize) -> Self {
        Self {
            free: AtomicUsize::new(free),
        }
    }

    /// Change the reported headroom.
    pub fn set_free(&self, free: usize) {
        self.free.store(free, Ordering::Release);
    }
}

impl ResourceProbe for SimResourceProbe {
    fn free_bytes(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }
}

/// The board with every peripheral simulated.
pub struct SimBoard {
    hw: HwVersion,
    strap_pins: u8,
    timebase: SimTimebase,
    counters: Option<[SimTimer; TIMER_GROUP_SIZE]>,
    spi: SimSpi,
    power: Arc<SimPowerStage>,
    events: EventLog,
    peripherals: Option<PeripheralPlan>,
    samples: Arc<AtomicU64>,
}

impl SimBoard {
    /// Build the board described by the `[board]` and `[simulation]`
    /// sections. Starts the bus completion thread.
    pub fn from_config(config: &BoardConfig) -> io::Result<Self> {
        let hw = config.board.hw_version;
        let sim = &config.simulation;
        let spi = SimSpi::start()?;
        for axis in 0..axon_common::consts::AXIS_COUNT {
            let device = gate_driver_device(axis);
            spi.add_gate_driver(device);
            if sim.faulty_gate_drivers.contains(&(axis as u8)) {
                spi.inject_gate_fault(device);
            }
        }
        for &cs in &sim.failing_bus_devices {
            spi.fail_device(DeviceId(cs));
        }

        let timebase = SimTimebase::new();
        let sync_start = !sim.no_sync_start;
        let counters = [
            timebase.counter("tim1", TIM_1_8_PERIOD_CLOCKS, sync_start),
            timebase.counter("tim8", TIM_1_8_PERIOD_CLOCKS, sync_start),
            timebase.counter("tim13", TIM_1_8_PERIOD_CLOCKS, sync_start),
        ];
        let events = EventLog::default();

        Ok(Self {
            hw,
            strap_pins: sim.i2c_strap_pins,
            timebase,
            counters: Some(counters),
            spi,
            power: Arc::new(SimPowerStage::new(events.clone())),
            events,
            peripherals: None,
            samples: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Simulated bus and device models.
    pub fn spi(&self) -> &SimSpi {
        &self.spi
    }

    /// Shared counter clock.
    pub fn timebase(&self) -> &SimTimebase {
        &self.timebase
    }

    /// Simulated power stage.
    pub fn power(&self) -> &Arc<SimPowerStage> {
        &self.power
    }

    /// Platform calls so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Peripheral setup applied during boot.
    pub fn peripherals(&self) -> Option<&PeripheralPlan> {
        self.peripherals.as_ref()
    }

    /// Iterations of the analog sampling context.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

/// Chip select of the simulated gate driver of `axis`.
pub(crate) fn gate_driver_device(axis: usize) -> DeviceId {
    DeviceId(SIM_GATE_DRIVER_BASE + axis as u8)
}

impl Platform for SimBoard {
    type Counter = SimTimer;

    fn hw_version(&self) -> HwVersion {
        self.hw
    }

    fn init_low_level(&mut self) {
        self.record("init_low_level");
    }

    fn take_counters(&mut self) -> Option<[SimTimer; TIMER_GROUP_SIZE]> {
        self.counters.take()
    }

    fn start_trigger(&self) -> &dyn StartTrigger {
        &self.timebase
    }

    fn read_i2c_strap_pins(&self) -> u8 {
        self.strap_pins
    }

    fn init_peripherals(&mut self, plan: &PeripheralPlan) -> Result<(), PlatformError> {
        if let Some(0) = plan.uart_baudrate {
            return Err(PlatformError::new("uart init", "baud rate 0"));
        }
        self.record(format!("init_peripherals {:?}", plan.comm));
        self.peripherals = Some(plan.clone());
        Ok(())
    }

    fn shared_bus(&self) -> Arc<dyn SharedBus> {
        self.spi.arbiter()
    }

    fn gate_driver_device(&self, axis: usize) -> DeviceId {
        gate_driver_device(axis)
    }

    fn init_communication(&mut self, ctx: &Arc<BoardContext>) -> Result<(), PlatformError> {
        if ctx.axes().is_empty() {
            return Err(PlatformError::new("communication init", "no axes registered"));
        }
        self.record(format!(
            "init_communication axes={} transfers={}",
            ctx.axes().len(),
            self.spi.transfers().len()
        ));
        info!("Simulated communication up on {:?}", ctx.comm());
        Ok(())
    }

    fn power_stage(&self) -> Arc<dyn PowerStage> {
        self.power.clone()
    }

    fn spawn_analog_sampling(&mut self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        self.record("analog_sampling.start");
        let samples = self.samples.clone();
        let timebase = self.timebase.clone();
        thread::Builder::new()
            .name("analog".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    timebase.advance(u64::from(TIM_1_8_PERIOD_CLOCKS) * 2);
                    samples.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(SAMPLING_PERIOD);
                }
                debug!("Analog sampling stopped");
            })
    }

    fn delay(&self, duration: Duration) {
        self.record(format!("delay {}ms", duration.as_millis()));
        thread::sleep(duration);
    }
}
