//! Hardware revision and per-axis board wiring tables.
//!
//! Defaults that depend on board identity (GPIO assignment, thermistor
//! channels, control deadlines) are derived from these tables rather
//! than being stored in the persisted blocks.

use crate::consts::{AXIS_COUNT, TIM_1_8_PERIOD_CLOCKS};
use serde::{Deserialize, Serialize};

/// Board hardware revision (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HwVersion {
    /// Major revision.
    pub major: u8,
    /// Minor revision.
    pub minor: u8,
}

impl HwVersion {
    /// Revision 3.3.
    pub const V3_3: Self = Self::new(3, 3);
    /// Revision 3.4.
    pub const V3_4: Self = Self::new(3, 4);
    /// Revision 3.5.
    pub const V3_5: Self = Self::new(3, 5);
    /// Revision 3.6.
    pub const V3_6: Self = Self::new(3, 6);

    /// Create a revision.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether this crate carries wiring tables for the revision.
    pub const fn is_known(&self) -> bool {
        self.major == 3 && self.minor >= 1 && self.minor <= 6
    }

    /// Boards from 3.3 onward can run I2C on the CAN pins.
    pub const fn has_i2c_option(&self) -> bool {
        self.major == 3 && self.minor >= 3
    }

    /// DFU reboot is only safe from 3.5 onward; older boards can burn the
    /// brake resistor FETs while the bootloader runs.
    pub const fn supports_dfu(&self) -> bool {
        self.major == 3 && self.minor >= 5
    }

    /// Number of user GPIOs broken out on the board.
    pub const fn gpio_count(&self) -> u16 {
        match self.minor {
            1 | 2 => 4,
            3 | 4 => 5,
            _ => 8,
        }
    }
}

impl Default for HwVersion {
    fn default() -> Self {
        Self::V3_6
    }
}

impl std::fmt::Display for HwVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// Fixed wiring of one motor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisHwConfig {
    /// Default step input GPIO (1-based, as labeled on the board).
    pub step_gpio_pin: u16,
    /// Default direction input GPIO.
    pub dir_gpio_pin: u16,
    /// ADC channel of the inverter thermistor.
    pub thermistor_adc_ch: u16,
    /// Latest counter value at which the control loop must have finished [clocks].
    pub control_deadline: u32,
}

/// Wiring table for every axis of the given revision.
pub fn axis_hw_configs(hw: HwVersion) -> [AxisHwConfig; AXIS_COUNT] {
    let axis1_step_dir = if hw.minor >= 5 { (7, 8) } else { (3, 4) };
    let axis1_thermistor = if hw.minor >= 3 { 4 } else { 1 };
    [
        AxisHwConfig {
            step_gpio_pin: 1,
            dir_gpio_pin: 2,
            thermistor_adc_ch: 15,
            control_deadline: TIM_1_8_PERIOD_CLOCKS,
        },
        AxisHwConfig {
            step_gpio_pin: axis1_step_dir.0,
            dir_gpio_pin: axis1_step_dir.1,
            thermistor_adc_ch: axis1_thermistor,
            control_deadline: (3 * TIM_1_8_PERIOD_CLOCKS) / 2,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dfu_gate_follows_revision() {
        assert!(!HwVersion::V3_3.supports_dfu());
        assert!(!HwVersion::V3_4.supports_dfu());
        assert!(HwVersion::V3_5.supports_dfu());
        assert!(HwVersion::V3_6.supports_dfu());
    }

    #[test]
    fn axis1_step_dir_depends_on_revision() {
        let old = axis_hw_configs(HwVersion::V3_4);
        let new = axis_hw_configs(HwVersion::V3_6);
        assert_eq!((old[1].step_gpio_pin, old[1].dir_gpio_pin), (3, 4));
        assert_eq!((new[1].step_gpio_pin, new[1].dir_gpio_pin), (7, 8));
        assert_eq!((new[0].step_gpio_pin, new[0].dir_gpio_pin), (1, 2));
    }

    #[test]
    fn unknown_revision_rejected() {
        assert!(!HwVersion::new(4, 0).is_known());
        assert!(HwVersion::default().is_known());
    }

    #[test]
    fn display_format() {
        assert_eq!(HwVersion::V3_5.to_string(), "v3.5");
    }
}
