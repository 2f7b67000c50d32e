//! Platform implementations.
//!
//! - [`simulation`] - Host simulation of the board for development and testing
//!
//! # Adding a Platform
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement [`Platform`](crate::boot::Platform) and its counter type
//! 3. Put the bus peripheral behind a [`BusArbiter`](crate::bus::BusArbiter)
//! 4. Provide a [`ConfigStore`](crate::nvm::ConfigStore) for the configuration region

pub mod simulation;
