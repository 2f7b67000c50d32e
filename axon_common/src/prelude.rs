//! Prelude module for common re-exports.
//!
//! ```rust
//! use axon_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{BoardConfig, ConfigError, ConfigLoader, LogLevel, SharedConfig};

// ─── Board Constants ────────────────────────────────────────────────
pub use crate::consts::{AXIS_COUNT, BUS_QUEUE_DEPTH, MAX_FRAME_LEN, TIM_1_8_PERIOD_CLOCKS};

// ─── Hardware ───────────────────────────────────────────────────────
pub use crate::hw::{axis_hw_configs, AxisHwConfig, HwVersion};

// ─── Persisted Blocks ───────────────────────────────────────────────
pub use crate::blocks::{
    AxisBlock, BoardBlock, CanBlock, ControllerBlock, EncoderBlock, EncoderMode, EndstopBlock,
    MotorBlock, MotorType, SensorlessBlock, TrapTrajBlock,
};
pub use crate::layout::{
    AxisConfigSet, ConfigSet, LayoutError, Slot, SlotKind, CONFIG_SCHEMA, SCHEMA_VERSION,
};
