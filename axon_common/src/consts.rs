//! Board-wide constants for the Axon workspace.
//!
//! Single source of truth for numeric limits and timing defaults.

/// Number of motor channels on the board.
pub const AXIS_COUNT: usize = 2;

/// PWM counter period of the two motor timers, in timer clocks.
pub const TIM_1_8_PERIOD_CLOCKS: u32 = 3500;

/// Phase lead applied to the sampling counter relative to the half period.
pub const TIM_SAMPLING_LEAD_CLOCKS: u32 = 128;

/// Number of counters in the board's synchronized start group.
pub const TIMER_GROUP_SIZE: usize = 3;

/// Maximum number of requests waiting on the shared bus.
pub const BUS_QUEUE_DEPTH: usize = 8;

/// Maximum bytes in one bus transfer frame.
pub const MAX_FRAME_LEN: usize = 4;

/// Default NVM region capacity in bytes (one 128 KiB flash sector).
pub const DEFAULT_NVM_CAPACITY: usize = 128 * 1024;

/// Default settling delay between power-stage enable and axis start [ms].
pub const STARTUP_SETTLE_MS: u64 = 1500;

/// Default per-device bus timeout during hardware setup [ms].
pub const DEVICE_SETUP_TIMEOUT_MS: u64 = 100;

/// Default NVM backing file used by the host binary.
pub const DEFAULT_NVM_FILE: &str = "axon_nvm.bin";

/// Canonical service name used in logs.
pub const BOARD_SERVICE_NAME: &str = "axon_board";

/// Reboot cookie telling the bootloader to stay in DFU mode.
pub const DFU_REBOOT_COOKIE: u32 = 0xDEAD_BEEF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(AXIS_COUNT > 0 && AXIS_COUNT <= 8);
        assert!(TIM_SAMPLING_LEAD_CLOCKS < TIM_1_8_PERIOD_CLOCKS / 2);
        assert!(TIMER_GROUP_SIZE > AXIS_COUNT);
        assert!(BUS_QUEUE_DEPTH >= AXIS_COUNT * 2);
        assert!(MAX_FRAME_LEN >= 2);
    }
}
