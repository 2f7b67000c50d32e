//! Whole-configuration store and load on top of [`ConfigManager`].
//!
//! Both directions walk [`CONFIG_SCHEMA`], so store and load always see
//! the same block order.

use super::manager::ConfigManager;
use super::store::ConfigStore;
use super::NvmError;
use axon_common::hw::HwVersion;
use axon_common::layout::{ConfigSet, CONFIG_SCHEMA};
use std::fmt::Display;
use tracing::{error, info, warn};

/// Where the running configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Loaded from NVM and applied.
    Stored,
    /// Built-in defaults after a failed load or apply.
    Defaults {
        /// Why the stored configuration was not used.
        reason: String,
    },
}

/// Result of the boot-time configuration load.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Configuration to run with.
    pub set: ConfigSet,
    /// Origin of `set`.
    pub source: ConfigSource,
}

impl LoadedConfig {
    /// Whether a user configuration is in effect.
    pub fn user_config_loaded(&self) -> bool {
        self.source == ConfigSource::Stored
    }
}

/// Persist every block of `set`.
///
/// Each block is serialized once for the staging pass and again for the
/// write pass. A serialization failure in the first pass aborts before
/// the region is touched.
pub fn store_config<S: ConfigStore>(
    mgr: &mut ConfigManager<S>,
    set: &ConfigSet,
) -> Result<(), NvmError> {
    mgr.prepare_store()?;
    push_all(mgr, set)?;
    mgr.start_store()?;
    push_all(mgr, set)?;
    mgr.finish_store()
}

fn push_all<S: ConfigStore>(mgr: &mut ConfigManager<S>, set: &ConfigSet) -> Result<(), NvmError> {
    for slot in CONFIG_SCHEMA {
        let bytes = match set.encode_slot(slot) {
            Ok(bytes) => bytes,
            Err(e) => {
                mgr.abort();
                return Err(e.into());
            }
        };
        mgr.push(slot, &bytes)?;
    }
    Ok(())
}

/// Read every block from NVM.
///
/// Blocks are decoded into a scratch set, so a failure part way through
/// never yields partially loaded data.
pub fn load_config<S: ConfigStore>(mgr: &mut ConfigManager<S>) -> Result<ConfigSet, NvmError> {
    mgr.start_load()?;
    let mut scratch = ConfigSet::default();
    for slot in CONFIG_SCHEMA {
        let decoded = scratch.decode_slot(slot, mgr.pop(slot)?);
        if let Err(e) = decoded {
            mgr.abort();
            return Err(e.into());
        }
    }
    mgr.finish_load()?;
    Ok(scratch)
}

/// Load and apply the stored configuration, falling back to defaults.
///
/// `apply` checks a candidate configuration against the hardware. When
/// loading or applying fails, every block is reset to defaults for `hw`
/// and applied instead. This path never fails.
pub fn load_or_default<S, E, F>(mgr: &mut ConfigManager<S>, hw: HwVersion, mut apply: F) -> LoadedConfig
where
    S: ConfigStore,
    E: Display,
    F: FnMut(&ConfigSet) -> Result<(), E>,
{
    let reason = match load_config(mgr) {
        Ok(set) => match apply(&set) {
            Ok(()) => {
                info!("Stored configuration loaded and applied");
                return LoadedConfig {
                    set,
                    source: ConfigSource::Stored,
                };
            }
            Err(e) => format!("apply failed: {}", e),
        },
        Err(e) => format!("load failed: {}", e),
    };

    warn!("Using default configuration ({})", reason);
    let set = ConfigSet::defaults(hw);
    if let Err(e) = apply(&set) {
        // Defaults are built for this board; rejection is a firmware bug.
        error!("Default configuration for {} rejected: {}", hw, e);
        debug_assert!(false, "default configuration for {hw} rejected: {e}");
    }
    LoadedConfig {
        set,
        source: ConfigSource::Defaults { reason },
    }
}
