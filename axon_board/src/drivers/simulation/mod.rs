//! Simulated board.
//!
//! Software models of the SPI bus with its gate drivers and encoders, the
//! counter group, the power stage and the configuration flash, so the
//! whole boot sequence runs on a host without hardware.

mod board;
mod nvm;
mod spi;
mod timer;

pub use board::{SimBoard, SimPowerStage, SimResourceProbe};
pub use nvm::{FileStore, RamStore};
pub use spi::{SimSpi, SimSpiBus, SIM_GATE_DRIVER_BASE};
pub use timer::{SimTimebase, SimTimer};
