//! Fixed-layout configuration blocks persisted to NVM.
//!
//! Every block contains only fixed-size fields (no strings, no vectors),
//! so its encoded length is a constant of the firmware build. The length
//! is part of the storage contract and is checked on load.
//!
//! Blocks carry the built-in defaults that are not board dependent.
//! Board- and axis-dependent defaults are applied by
//! [`ConfigSet::defaults`](crate::layout::ConfigSet::defaults).

use crate::hw::AxisHwConfig;
use serde::{Deserialize, Serialize};

/// Board-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardBlock {
    /// Enable the UART on GPIO 1/2.
    pub enable_uart: bool,
    /// UART baud rate.
    pub uart_baudrate: u32,
    /// Use I2C instead of CAN on the shared pins (hardware 3.3+).
    pub enable_i2c_instead_of_can: bool,
    /// Accept the ASCII protocol on USB.
    pub enable_ascii_protocol_on_usb: bool,
    /// Maximum regenerative current [A].
    pub max_regen_current: f32,
    /// Brake resistor value [Ohm].
    pub brake_resistance: f32,
    /// DC bus undervoltage trip level [V].
    pub dc_bus_undervoltage_trip_level: f32,
    /// DC bus overvoltage trip level [V].
    pub dc_bus_overvoltage_trip_level: f32,
}

impl Default for BoardBlock {
    fn default() -> Self {
        Self {
            enable_uart: true,
            uart_baudrate: 115_200,
            enable_i2c_instead_of_can: false,
            enable_ascii_protocol_on_usb: true,
            max_regen_current: 0.0,
            brake_resistance: 2.0,
            dc_bus_undervoltage_trip_level: 8.0,
            dc_bus_overvoltage_trip_level: 59.92,
        }
    }
}

/// CAN protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CanProtocol {
    /// Simple command/heartbeat protocol.
    #[default]
    Simple,
    /// CANopen subset.
    CanOpen,
}

/// CAN interface configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanBlock {
    /// Bus bit rate [bit/s].
    pub baud_rate: u32,
    /// Protocol spoken on the bus.
    pub protocol: CanProtocol,
}

impl Default for CanBlock {
    fn default() -> Self {
        Self {
            baud_rate: 250_000,
            protocol: CanProtocol::Simple,
        }
    }
}

/// Position sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncoderMode {
    /// Quadrature encoder on a hardware counter.
    #[default]
    Incremental,
    /// Hall-effect sensors.
    Hall,
    /// Absolute encoder read over the shared SPI bus (14-bit AMS frame).
    SpiAbsoluteAms,
}

/// Encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderBlock {
    /// Sensor type.
    pub mode: EncoderMode,
    /// Counts per revolution.
    pub cpr: u32,
    /// Search for the index pulse at startup.
    pub use_index: bool,
    /// Electrical offset found by calibration [counts].
    pub offset: i32,
    /// Accepted calibration error [fraction of a turn].
    pub calib_range: f32,
    /// Estimator bandwidth [rad/s].
    pub bandwidth: f32,
    /// Chip-select GPIO for absolute SPI encoders.
    pub abs_spi_cs_gpio_pin: u16,
    /// Offset calibration is valid across reboots.
    pub pre_calibrated: bool,
}

impl Default for EncoderBlock {
    fn default() -> Self {
        Self {
            mode: EncoderMode::Incremental,
            cpr: 8192,
            use_index: false,
            offset: 0,
            calib_range: 0.02,
            bandwidth: 1000.0,
            abs_spi_cs_gpio_pin: 1,
            pre_calibrated: false,
        }
    }
}

/// Sensorless estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorlessBlock {
    /// Observer gain [rad/s].
    pub observer_gain: f32,
    /// PLL bandwidth [rad/s].
    pub pll_bandwidth: f32,
    /// Permanent magnet flux linkage [Wb].
    pub pm_flux_linkage: f32,
}

impl Default for SensorlessBlock {
    fn default() -> Self {
        Self {
            observer_gain: 1000.0,
            pll_bandwidth: 1000.0,
            pm_flux_linkage: 1.58e-3,
        }
    }
}

/// Outer control loop mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    /// Direct voltage command.
    Voltage,
    /// Torque (current) control.
    Torque,
    /// Velocity control.
    Velocity,
    /// Position control.
    #[default]
    Position,
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerBlock {
    /// Active control mode.
    pub control_mode: ControlMode,
    /// Position gain [(turn/s)/turn].
    pub pos_gain: f32,
    /// Velocity gain [Nm/(turn/s)].
    pub vel_gain: f32,
    /// Velocity integrator gain [Nm/turn].
    pub vel_integrator_gain: f32,
    /// Velocity limit [turn/s].
    pub vel_limit: f32,
    /// Axis whose encoder feeds the position/velocity loops.
    pub load_encoder_axis: u8,
}

impl Default for ControllerBlock {
    fn default() -> Self {
        Self {
            control_mode: ControlMode::Position,
            pos_gain: 20.0,
            vel_gain: 1.0 / 6.0,
            vel_integrator_gain: 1.0 / 3.0,
            vel_limit: 2.0,
            load_encoder_axis: 0,
        }
    }
}

/// Trapezoidal trajectory planner limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapTrajBlock {
    /// Cruise velocity [turn/s].
    pub vel_limit: f32,
    /// Acceleration [turn/s^2].
    pub accel_limit: f32,
    /// Deceleration [turn/s^2].
    pub decel_limit: f32,
}

impl Default for TrapTrajBlock {
    fn default() -> Self {
        Self {
            vel_limit: 2.0,
            accel_limit: 0.5,
            decel_limit: 0.5,
        }
    }
}

/// Endstop switch configuration (used for both min and max switches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndstopBlock {
    /// GPIO number (0 = unassigned).
    pub gpio_num: u16,
    /// Switch is monitored.
    pub enabled: bool,
    /// Position of the switch relative to home [turn].
    pub offset: f32,
    /// Debounce time [ms].
    pub debounce_ms: u32,
    /// Switch reads high when pressed.
    pub is_active_high: bool,
}

impl Default for EndstopBlock {
    fn default() -> Self {
        Self {
            gpio_num: 0,
            enabled: false,
            offset: 0.0,
            debounce_ms: 50,
            is_active_high: false,
        }
    }
}

/// Motor construction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotorType {
    /// Low-inductance high-current motor with current control.
    #[default]
    HighCurrent,
    /// High-resistance gimbal motor driven in voltage mode.
    Gimbal,
    /// AC induction motor.
    Acim,
}

/// Motor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorBlock {
    /// Motor construction type.
    pub motor_type: MotorType,
    /// Pole pairs.
    pub pole_pairs: u32,
    /// Current used during calibration [A].
    pub calibration_current: f32,
    /// Maximum voltage during resistance measurement [V].
    pub resistance_calib_max_voltage: f32,
    /// Current limit [A].
    pub current_lim: f32,
    /// Current sense range requested from the gate driver amplifier [A].
    pub requested_current_range: f32,
    /// Phase resistance/inductance are valid across reboots.
    pub pre_calibrated: bool,
    /// Measured phase resistance [Ohm].
    pub phase_resistance: f32,
    /// Measured phase inductance [H].
    pub phase_inductance: f32,
}

impl Default for MotorBlock {
    fn default() -> Self {
        Self {
            motor_type: MotorType::HighCurrent,
            pole_pairs: 7,
            calibration_current: 10.0,
            resistance_calib_max_voltage: 2.0,
            current_lim: 10.0,
            requested_current_range: 60.0,
            pre_calibrated: false,
            phase_resistance: 0.0,
            phase_inductance: 0.0,
        }
    }
}

/// Axis-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisBlock {
    /// Run motor calibration at startup.
    pub startup_motor_calibration: bool,
    /// Search the encoder index at startup.
    pub startup_encoder_index_search: bool,
    /// Run encoder offset calibration at startup.
    pub startup_encoder_offset_calibration: bool,
    /// Enter closed-loop control at startup.
    pub startup_closed_loop_control: bool,
    /// Accept step/direction input.
    pub enable_step_dir: bool,
    /// Step input GPIO.
    pub step_gpio_pin: u16,
    /// Direction input GPIO.
    pub dir_gpio_pin: u16,
    /// CAN node id.
    pub can_node_id: u32,
    /// CAN heartbeat period [ms].
    pub can_heartbeat_rate_ms: u32,
}

impl Default for AxisBlock {
    fn default() -> Self {
        Self {
            startup_motor_calibration: false,
            startup_encoder_index_search: false,
            startup_encoder_offset_calibration: false,
            startup_closed_loop_control: false,
            enable_step_dir: false,
            step_gpio_pin: 0,
            dir_gpio_pin: 0,
            can_node_id: 0,
            can_heartbeat_rate_ms: 100,
        }
    }
}

impl AxisBlock {
    /// Load the board's default step/dir pins for this axis.
    pub fn load_default_step_dir_pins(&mut self, hw: &AxisHwConfig) {
        self.step_gpio_pin = hw.step_gpio_pin;
        self.dir_gpio_pin = hw.dir_gpio_pin;
    }

    /// Load the default CAN node id, which is the axis index.
    pub fn load_default_can_id(&mut self, axis_index: usize) {
        self.can_node_id = axis_index as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{axis_hw_configs, HwVersion};

    #[test]
    fn step_dir_defaults_from_wiring() {
        let hw = axis_hw_configs(HwVersion::V3_6);
        let mut block = AxisBlock::default();
        block.load_default_step_dir_pins(&hw[1]);
        assert_eq!(block.step_gpio_pin, 7);
        assert_eq!(block.dir_gpio_pin, 8);
    }

    #[test]
    fn can_id_default_is_axis_index() {
        let mut block = AxisBlock::default();
        block.load_default_can_id(1);
        assert_eq!(block.can_node_id, 1);
    }

    #[test]
    fn encoded_length_is_value_independent() {
        let a = bincode::serialize(&MotorBlock::default()).unwrap();
        let b = bincode::serialize(&MotorBlock {
            motor_type: MotorType::Acim,
            pole_pairs: 21,
            pre_calibrated: true,
            ..MotorBlock::default()
        })
        .unwrap();
        assert_eq!(a.len(), b.len());
    }
}
