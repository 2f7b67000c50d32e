//! Boot sequence.
//!
//! Brings the board from reset to `fully_booted` in a fixed order. Each
//! step depends on the previous ones; any failure halts the sequence
//! with the motors disarmed.
//!
//! ```text
//!  LowLevelInit ─▶ TimersSynced ─▶ ConfigLoaded ─▶ PeripheralsReady
//!        │                                               │
//!        ▼                                               ▼
//!  (debug freeze)                              ObjectsConstructed
//!                                                        │
//!  FullyBooted ◀─ AxesRunning ◀─ Settled ◀─ PowerStageEnabled
//!                                                ▲
//!                       CommunicationReady ─▶ DevicesSetUp
//! ```
//!
//! Two ordering constraints matter for safety: communication starts only
//! once every axis object exists (requests reference them), and the
//! power stage is enabled only after every device passed hardware setup.

mod context;
mod platform;

pub use context::{Board, BoardContext};
pub use platform::{CommBus, PeripheralPlan, Platform, PlatformError};

use crate::axis::{Axis, AxisLoop};
use crate::bus::DeviceId;
use crate::devices::{DeviceError, Encoder, GateDriver, Motor};
use crate::nvm::{load_or_default, ConfigManager, ConfigStore};
use crate::safety::SafetyHook;
use crate::timer::{board_offsets, SyncCounter, TimerError, TimerGroup};
use axon_common::blocks::{BoardBlock, CanBlock, EncoderMode};
use axon_common::config::BootSection;
use axon_common::hw::{axis_hw_configs, HwVersion};
use axon_common::layout::ConfigSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Base of the I2C slave address; the strap pins select the low bits.
const I2C_BASE_ADDRESS: u8 = 0xD << 3;

/// CAN bit rates the controller can be clocked for.
const SUPPORTED_CAN_BAUD_RATES: [u32; 4] = [125_000, 250_000, 500_000, 1_000_000];

/// Steps of the boot sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    /// Clocks, GPIO and counters configured.
    LowLevelInit,
    /// Counter group started with its fixed phase offsets.
    TimersSynced,
    /// Stored configuration or defaults in effect.
    ConfigLoaded,
    /// UART and CAN/I2C peripherals configured.
    PeripheralsReady,
    /// Motors, encoders and axes built.
    ObjectsConstructed,
    /// Communication layer running.
    CommunicationReady,
    /// Every gate driver and encoder passed setup.
    DevicesSetUp,
    /// PWM and sampling interrupts enabled.
    PowerStageEnabled,
    /// Analog front end settled.
    Settled,
    /// Axis and sampling contexts started.
    AxesRunning,
    /// Boot complete.
    FullyBooted,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStage::LowLevelInit => "low-level init",
            BootStage::TimersSynced => "timer sync",
            BootStage::ConfigLoaded => "config load",
            BootStage::PeripheralsReady => "peripheral init",
            BootStage::ObjectsConstructed => "object construction",
            BootStage::CommunicationReady => "communication start",
            BootStage::DevicesSetUp => "device setup",
            BootStage::PowerStageEnabled => "power stage enable",
            BootStage::Settled => "settling",
            BootStage::AxesRunning => "axis start",
            BootStage::FullyBooted => "fully booted",
        };
        f.write_str(name)
    }
}

/// Cause of a halted boot.
#[derive(Debug, Error)]
pub enum BootErrorKind {
    /// The platform no longer owns its counter group.
    #[error("counter group already taken")]
    CountersUnavailable,

    /// Synchronized counter start failed.
    #[error(transparent)]
    Timer(#[from] TimerError),

    /// A device failed construction or setup.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A platform operation failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// An execution context could not be started.
    #[error("failed to start {context}: {reason}")]
    Thread {
        /// Context name.
        context: String,
        /// OS error.
        reason: String,
    },
}

/// Fatal boot failure. The board stays halted with motors disarmed.
#[derive(Debug, Error)]
#[error("Boot halted at {stage}: {kind}")]
pub struct BootError {
    /// Step that failed.
    pub stage: BootStage,
    /// What went wrong.
    #[source]
    pub kind: BootErrorKind,
}

impl BootError {
    fn at(stage: BootStage) -> impl FnOnce(BootErrorKind) -> Self {
        move |kind| Self { stage, kind }
    }
}

/// Check a full configuration set against the hardware without applying it.
pub fn check_config_set(set: &ConfigSet, hw: HwVersion) -> Result<(), String> {
    let board = &set.board;
    if board.enable_uart && board.uart_baudrate == 0 {
        return Err("board: uart_baudrate must be positive".to_string());
    }
    if !(board.dc_bus_undervoltage_trip_level < board.dc_bus_overvoltage_trip_level) {
        return Err(format!(
            "board: undervoltage trip {} V not below overvoltage trip {} V",
            board.dc_bus_undervoltage_trip_level, board.dc_bus_overvoltage_trip_level
        ));
    }
    if !(board.brake_resistance > 0.0) {
        return Err(format!(
            "board: brake_resistance {} must be positive",
            board.brake_resistance
        ));
    }
    if !SUPPORTED_CAN_BAUD_RATES.contains(&set.can.baud_rate) {
        return Err(format!("can: unsupported baud rate {}", set.can.baud_rate));
    }

    let gpio_count = hw.gpio_count();
    for (index, axis) in set.axes.iter().enumerate() {
        Axis::check_config(axis).map_err(|e| format!("axis{index}.{e}"))?;
        let pins = [
            (
                "abs_spi_cs_gpio_pin",
                axis.encoder.abs_spi_cs_gpio_pin,
                axis.encoder.mode == EncoderMode::SpiAbsoluteAms,
            ),
            ("step_gpio_pin", axis.axis.step_gpio_pin, axis.axis.enable_step_dir),
            ("dir_gpio_pin", axis.axis.dir_gpio_pin, axis.axis.enable_step_dir),
            ("min_endstop.gpio_num", axis.min_endstop.gpio_num, axis.min_endstop.enabled),
            ("max_endstop.gpio_num", axis.max_endstop.gpio_num, axis.max_endstop.enabled),
        ];
        for (name, pin, used) in pins {
            if used && (pin == 0 || pin > gpio_count) {
                return Err(format!(
                    "axis{index}: {name} {pin} outside GPIO 1..={gpio_count} on {hw}"
                ));
            }
        }
    }
    Ok(())
}

/// Derive the peripheral setup from the loaded configuration.
///
/// The CAN and I2C controllers share pins. I2C is only available from
/// v3.3 on, where the strap pins A0..A2 select the low address bits.
pub fn peripheral_plan(
    board: &BoardBlock,
    can: &CanBlock,
    hw: HwVersion,
    strap_pins: u8,
) -> PeripheralPlan {
    let comm = if hw.has_i2c_option() && board.enable_i2c_instead_of_can {
        CommBus::I2c {
            address: I2C_BASE_ADDRESS | (strap_pins & 0b111),
        }
    } else {
        if board.enable_i2c_instead_of_can {
            warn!("I2C requested but not available on {}, using CAN", hw);
        }
        CommBus::Can
    };
    PeripheralPlan {
        uart_baudrate: board.enable_uart.then_some(board.uart_baudrate),
        comm,
        can: can.clone(),
    }
}

/// Runs the boot sequence on a platform.
pub struct BootOrchestrator<P: Platform, S: ConfigStore> {
    platform: P,
    nvm: ConfigManager<S>,
    timing: BootSection,
}

impl<P: Platform, S: ConfigStore> BootOrchestrator<P, S> {
    /// Prepare to boot `platform` with configuration stored in `nvm`.
    pub fn new(platform: P, nvm: ConfigManager<S>, timing: BootSection) -> Self {
        Self {
            platform,
            nvm,
            timing,
        }
    }

    /// Run every boot step in order.
    ///
    /// `axis_loop` is started on each axis' own context once the power
    /// stage has settled.
    pub fn boot(self, axis_loop: Arc<dyn AxisLoop>) -> Result<Board<P, S>, BootError> {
        let Self {
            mut platform,
            mut nvm,
            timing,
        } = self;
        let started_at = Instant::now();

        // Low-level init
        platform.init_low_level();
        let hw = platform.hw_version();
        if !hw.is_known() {
            warn!("Unknown hardware revision {}, using closest tables", hw);
        }
        let mut counters = platform
            .take_counters()
            .ok_or(BootErrorKind::CountersUnavailable)
            .map_err(BootError::at(BootStage::LowLevelInit))?;
        for counter in counters.iter_mut() {
            counter.set_debug_freeze(true);
        }
        info!("Low-level init done on hardware {}", hw);

        // Synchronized counter start
        let counters = TimerGroup::new(counters, board_offsets())
            .start_synchronously(platform.start_trigger())
            .map_err(|e| BootError::at(BootStage::TimersSynced)(e.into()))?;

        // Configuration
        let loaded = load_or_default(&mut nvm, hw, |set: &ConfigSet| check_config_set(set, hw));
        info!(
            "Configuration ready (user config loaded: {})",
            loaded.user_config_loaded()
        );

        // Peripherals
        let plan = peripheral_plan(
            &loaded.set.board,
            &loaded.set.can,
            hw,
            platform.read_i2c_strap_pins(),
        );
        platform
            .init_peripherals(&plan)
            .map_err(|e| BootError::at(BootStage::PeripheralsReady)(e.into()))?;
        info!("Peripherals ready: uart {:?}, {:?}", plan.uart_baudrate, plan.comm);

        // Objects
        let bus = platform.shared_bus();
        let wiring = axis_hw_configs(hw);
        let mut axes = Vec::with_capacity(loaded.set.axes.len());
        for (index, set) in loaded.set.axes.iter().enumerate() {
            let gate_driver = GateDriver::new(
                format!("axis{index}.gate_driver"),
                bus.clone(),
                platform.gate_driver_device(index),
            );
            let motor = Motor::new(format!("axis{index}.motor"), gate_driver, set.motor.clone());
            let encoder = Encoder::new(
                format!("axis{index}.encoder"),
                bus.clone(),
                DeviceId(set.encoder.abs_spi_cs_gpio_pin as u8),
                set.encoder.clone(),
            );
            let axis = Axis::new(index, wiring[index], motor, encoder, set)
                .map_err(|e| BootError::at(BootStage::ObjectsConstructed)(e.into()))?;
            axes.push(axis);
        }
        let [pwm0, pwm1, sampling] = counters;
        axes[0].motor().attach_pwm(Box::new(pwm0));
        axes[1].motor().attach_pwm(Box::new(pwm1));

        let power = platform.power_stage();
        let hook = Arc::new(SafetyHook::new(power.clone()));
        hook.attach_axes(axes.clone());
        let ctx = Arc::new(BoardContext::new(
            hw,
            axes,
            loaded.set.board.clone(),
            loaded.set.can.clone(),
            plan.comm,
            bus,
            loaded.user_config_loaded(),
            started_at,
        ));
        info!("{} axes constructed", ctx.axes().len());

        // Communication
        platform
            .init_communication(&ctx)
            .map_err(|e| BootError::at(BootStage::CommunicationReady)(e.into()))?;
        info!("Communication ready");

        // Device setup
        for axis in ctx.axes() {
            if let Err(e) = axis.setup(timing.setup_timeout()) {
                hook.disarm_all();
                error!("Axis {} setup failed: {}", axis.index(), e);
                return Err(BootError::at(BootStage::DevicesSetUp)(e.into()));
            }
            debug!("Axis {} devices set up", axis.index());
        }
        info!("All devices set up");

        // Power stage
        power.enable();
        info!("Power stage enabled");

        platform.delay(timing.settle_delay());
        debug!("Settled after {:?}", timing.settle_delay());

        // Execution contexts
        let shutdown = ctx.shutdown_flag().clone();
        for axis in ctx.axes() {
            if let Err(e) = axis.start_thread(axis_loop.clone(), shutdown.clone()) {
                return Err(abort_running(
                    &ctx,
                    &hook,
                    format!("axis{}", axis.index()),
                    e,
                ));
            }
        }
        let analog = match platform.spawn_analog_sampling(shutdown) {
            Ok(handle) => handle,
            Err(e) => return Err(abort_running(&ctx, &hook, "analog sampling".to_string(), e)),
        };

        ctx.mark_fully_booted();
        info!(
            "Board fully booted in {} ms",
            started_at.elapsed().as_millis()
        );

        Ok(Board {
            ctx,
            platform,
            nvm: Mutex::new(nvm),
            hook,
            sampling_counter: Box::new(sampling) as Box<dyn SyncCounter>,
            analog: Some(analog),
            config_source: loaded.source,
        })
    }
}

/// Stop contexts already started and disarm after a failed spawn.
fn abort_running(
    ctx: &BoardContext,
    hook: &SafetyHook,
    context: String,
    e: std::io::Error,
) -> BootError {
    ctx.request_shutdown();
    for axis in ctx.axes() {
        axis.join();
    }
    hook.disarm_all();
    error!("Failed to start {}: {}", context, e);
    BootError {
        stage: BootStage::AxesRunning,
        kind: BootErrorKind::Thread {
            context,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i2c_address_from_strap_pins() {
        let board = BoardBlock {
            enable_i2c_instead_of_can: true,
            ..BoardBlock::default()
        };
        let plan = peripheral_plan(&board, &CanBlock::default(), HwVersion::V3_5, 0b101);
        assert_eq!(plan.comm, CommBus::I2c { address: 0x6D });

        let plan = peripheral_plan(&board, &CanBlock::default(), HwVersion::V3_5, 0xF8);
        assert_eq!(plan.comm, CommBus::I2c { address: 0x68 });
    }

    #[test]
    fn can_selected_without_i2c_option() {
        let board = BoardBlock {
            enable_i2c_instead_of_can: true,
            ..BoardBlock::default()
        };
        let plan = peripheral_plan(&board, &CanBlock::default(), HwVersion::new(3, 2), 0);
        assert_eq!(plan.comm, CommBus::Can);

        let plan = peripheral_plan(&BoardBlock::default(), &CanBlock::default(), HwVersion::V3_6, 7);
        assert_eq!(plan.comm, CommBus::Can);
        assert_eq!(plan.uart_baudrate, Some(115_200));
    }

    #[test]
    fn defaults_pass_board_checks_on_every_known_revision() {
        let known: Vec<HwVersion> = (0..=9)
            .map(|minor| HwVersion::new(3, minor))
            .filter(HwVersion::is_known)
            .collect();
        assert_eq!(known.len(), 6);
        for hw in known {
            assert_eq!(check_config_set(&ConfigSet::defaults(hw), hw), Ok(()), "{hw}");
        }
    }

    #[test]
    fn huge_hall_pole_pairs_rejected_not_panicking() {
        let hw = HwVersion::V3_6;
        let mut set = ConfigSet::defaults(hw);
        set.axes[0].encoder.mode = EncoderMode::Hall;
        set.axes[0].motor.pole_pairs = 0x3000_0000;
        let err = check_config_set(&set, hw).unwrap_err();
        assert!(err.starts_with("axis0.encoder"), "{err}");
    }

    #[test]
    fn board_checks_reject_bad_blocks() {
        let hw = HwVersion::V3_6;
        let mut set = ConfigSet::defaults(hw);
        set.can.baud_rate = 300_000;
        assert!(check_config_set(&set, hw).unwrap_err().contains("baud"));

        let mut set = ConfigSet::defaults(hw);
        set.board.dc_bus_undervoltage_trip_level = 60.0;
        assert!(check_config_set(&set, hw).is_err());

        let mut set = ConfigSet::defaults(hw);
        set.axes[1].encoder.mode = EncoderMode::SpiAbsoluteAms;
        set.axes[1].encoder.cpr = 1 << 14;
        set.axes[1].encoder.abs_spi_cs_gpio_pin = 200;
        let err = check_config_set(&set, hw).unwrap_err();
        assert!(err.starts_with("axis1"), "{err}");
    }

    #[test]
    fn stages_are_ordered() {
        assert!(BootStage::CommunicationReady > BootStage::ObjectsConstructed);
        assert!(BootStage::PowerStageEnabled > BootStage::DevicesSetUp);
        assert_eq!(BootStage::DevicesSetUp.to_string(), "device setup");
    }
}
