//! Axon Common Library
//!
//! Shared constants, hardware-revision tables, persisted configuration
//! blocks and runtime configuration loading for the Axon board crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Board-wide numeric limits and timing constants
//! - [`hw`] - Hardware revision and per-axis board wiring tables
//! - [`blocks`] - Fixed-layout configuration blocks persisted to NVM
//! - [`layout`] - The versioned block schema and the in-memory `ConfigSet`
//! - [`config`] - TOML runtime configuration loading
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use axon_common::layout::{ConfigSet, CONFIG_SCHEMA};
//! use axon_common::hw::HwVersion;
//!
//! let defaults = ConfigSet::defaults(HwVersion::V3_6);
//! assert_eq!(CONFIG_SCHEMA.len(), 18);
//! assert_eq!(defaults.axes[1].axis.can_node_id, 1);
//! ```

pub mod blocks;
pub mod config;
pub mod consts;
pub mod hw;
pub mod layout;
pub mod prelude;
