//! # Axon Board Library
//!
//! Board core of the Axon dual-axis motor controller: shared bus
//! arbitration, synchronized counter start, transactional configuration
//! storage, device drivers, axis assembly and the boot sequence.
//!
//! # Module Structure
//!
//! - [`bus`] - FIFO arbiter for the shared SPI bus, blocking transfer mailbox
//! - [`timer`] - Synchronized start of the PWM and sampling counters
//! - [`nvm`] - Configuration transactions over the flash region
//! - [`devices`] - Gate driver, encoder and motor
//! - [`axis`] - Axis assembly and its execution context
//! - [`boot`] - Platform boundary, boot sequence and the booted board
//! - [`safety`] - Last-resort disarm on resource exhaustion
//! - [`system`] - Reboot requests and idle diagnostics
//! - [`drivers`] - Platform implementations (simulation)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BootOrchestrator                         │
//! │   ConfigManager ──▶ ConfigSet ──▶ Axis[0..2] ──▶ BoardContext    │
//! └───────┬──────────────────────┬──────────────────────┬────────────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐     ┌──────────────────┐    ┌─────────────────┐
//!  │ ConfigStore │     │    BusArbiter    │    │   TimerGroup    │
//!  │  (flash)    │     │ (SPI, FIFO, IRQ) │    │ (PWM0,PWM1,ADC) │
//!  └─────────────┘     └──────────────────┘    └─────────────────┘
//!                               ▲
//!            GateDriver ────────┤
//!            Encoder ───────────┘
//! ```

#![warn(missing_docs)]

pub mod axis;
pub mod boot;
pub mod bus;
pub mod devices;
pub mod drivers;
pub mod nvm;
pub mod safety;
pub mod system;
pub mod timer;

// Re-export key types for convenience
pub use crate::boot::{Board, BoardContext, BootError, BootOrchestrator, BootStage, Platform};
pub use crate::bus::{BusArbiter, BusError, SharedBus};
pub use crate::nvm::{ConfigManager, ConfigStore, NvmError};
pub use crate::safety::SafetyHook;
pub use crate::system::{Reboot, SystemStats};
