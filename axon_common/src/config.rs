//! Runtime configuration loading.
//!
//! The board binary reads a small TOML file describing the host-side
//! environment: log level, the NVM backing file, boot timing and the
//! simulation fault-injection knobs. This is separate from the persisted
//! configuration blocks, which live in NVM.
//!
//! # Usage
//!
//! ```rust,no_run
//! use axon_common::config::{BoardConfig, ConfigLoader, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = BoardConfig::load(Path::new("board.toml"))?;
//!     config.validate()?;
//!     println!("NVM file: {:?}", config.nvm.path);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    BOARD_SERVICE_NAME, DEFAULT_NVM_CAPACITY, DEFAULT_NVM_FILE, DEVICE_SETUP_TIMEOUT_MS,
    STARTUP_SETTLE_MS,
};
use crate::hw::HwVersion;
use crate::layout::min_nvm_capacity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    BOARD_SERVICE_NAME.to_string()
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "axon-bench-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Instance identifier used in logs.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[board]` section: identity of the hardware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardSection {
    /// Hardware revision.
    #[serde(default)]
    pub hw_version: HwVersion,
}

fn default_nvm_path() -> PathBuf {
    PathBuf::from(DEFAULT_NVM_FILE)
}

fn default_nvm_capacity() -> usize {
    DEFAULT_NVM_CAPACITY
}

/// `[nvm]` section: backing store of the configuration region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmSection {
    /// File emulating the flash region.
    #[serde(default = "default_nvm_path")]
    pub path: PathBuf,
    /// Region capacity [bytes].
    #[serde(default = "default_nvm_capacity")]
    pub capacity: usize,
}

impl Default for NvmSection {
    fn default() -> Self {
        Self {
            path: default_nvm_path(),
            capacity: default_nvm_capacity(),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    STARTUP_SETTLE_MS
}

fn default_setup_timeout_ms() -> u64 {
    DEVICE_SETUP_TIMEOUT_MS
}

/// `[boot]` section: boot sequencing timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootSection {
    /// Settling delay between power-stage enable and axis start [ms].
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Bus timeout for each device during hardware setup [ms].
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
}

impl Default for BootSection {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            setup_timeout_ms: default_setup_timeout_ms(),
        }
    }
}

impl BootSection {
    /// Settling delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Per-device setup timeout as a `Duration`.
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

fn default_min_free_bytes() -> usize {
    1024
}

/// `[simulation]` section: simulated board inputs and fault injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSection {
    /// Levels of the I2C address strap pins A0..A2 (bit 0 = A0).
    #[serde(default)]
    pub i2c_strap_pins: u8,
    /// Axes whose gate driver reports a fault during setup.
    #[serde(default)]
    pub faulty_gate_drivers: Vec<u8>,
    /// Chip-select lines whose transfers fail on the bus.
    #[serde(default)]
    pub failing_bus_devices: Vec<u8>,
    /// Counters lack the shared start trigger.
    #[serde(default)]
    pub no_sync_start: bool,
    /// Simulated free heap [bytes].
    #[serde(default)]
    pub free_heap: Option<usize>,
    /// Headroom floor below which the safety hook trips [bytes].
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: usize,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            i2c_strap_pins: 0,
            faulty_gate_drivers: Vec::new(),
            failing_bus_devices: Vec::new(),
            no_sync_start: false,
            free_heap: None,
            min_free_bytes: default_min_free_bytes(),
        }
    }
}

/// Complete host-side configuration of the board binary.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    /// Logging and identity.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Hardware identity.
    #[serde(default)]
    pub board: BoardSection,
    /// NVM backing store.
    #[serde(default)]
    pub nvm: NvmSection,
    /// Boot timing.
    #[serde(default)]
    pub boot: BootSection,
    /// Simulation knobs.
    #[serde(default)]
    pub simulation: SimulationSection,
}

impl BoardConfig {
    /// Parse from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Validation Rules
    /// 1. `shared.service_name` is not empty
    /// 2. `board.hw_version` is a known revision
    /// 3. `nvm.capacity` can hold the header plus every block of the schema
    /// 4. `boot.setup_timeout_ms` > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if !self.board.hw_version.is_known() {
            return Err(ConfigError::ValidationError(format!(
                "Unknown hardware revision {}",
                self.board.hw_version
            )));
        }

        let required = min_nvm_capacity();
        if self.nvm.capacity < required {
            return Err(ConfigError::ValidationError(format!(
                "NVM capacity {} bytes is below the {} bytes needed by the block schema",
                self.nvm.capacity, required
            )));
        }

        if self.boot.setup_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "boot.setup_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation: any serde-deserializable struct can be loaded.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_directive(), "warn");
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = BoardConfig::from_toml("").unwrap();
        assert_eq!(config.shared.service_name, BOARD_SERVICE_NAME);
        assert_eq!(config.board.hw_version, HwVersion::V3_6);
        assert_eq!(config.nvm.capacity, DEFAULT_NVM_CAPACITY);
        assert_eq!(config.boot.settle_delay_ms, STARTUP_SETTLE_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_capacity_below_schema_rejected() {
        let mut config = BoardConfig::default();
        config.nvm.capacity = min_nvm_capacity() - 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        config.nvm.capacity = min_nvm_capacity();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_revision_rejected() {
        let config = BoardConfig::from_toml("[board]\nhw_version = { major = 4, minor = 0 }\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = BoardConfig::from_toml("[boot]\nsettle_ms = 5\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_boot_durations() {
        let config = BoardConfig::from_toml("[boot]\nsettle_delay_ms = 20\nsetup_timeout_ms = 7\n")
            .unwrap();
        assert_eq!(config.boot.settle_delay(), Duration::from_millis(20));
        assert_eq!(config.boot.setup_timeout(), Duration::from_millis(7));
    }
}
