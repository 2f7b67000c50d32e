//! Board registry and the booted board handle.

use super::platform::{CommBus, Platform};
use crate::axis::Axis;
use crate::bus::SharedBus;
use crate::nvm::{store_config, ConfigManager, ConfigSource, ConfigStore, NvmError};
use crate::safety::SafetyHook;
use crate::system::{AxisStats, Diagnostics, Reboot, ResourceProbe, SystemError, SystemStats};
use crate::timer::SyncCounter;
use axon_common::blocks::{BoardBlock, CanBlock};
use axon_common::hw::HwVersion;
use axon_common::layout::{AxisConfigSet, ConfigSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{error, info, warn};

/// Registry of the objects built during boot.
///
/// Constructed exactly once and handed to every component that needs
/// access to the axes or board-wide state.
pub struct BoardContext {
    hw: HwVersion,
    axes: Vec<Arc<Axis>>,
    board: Mutex<BoardBlock>,
    can: Mutex<CanBlock>,
    comm: CommBus,
    bus: Arc<dyn SharedBus>,
    user_config_loaded: AtomicBool,
    fully_booted: AtomicBool,
    shutdown: Arc<AtomicBool>,
    started_at: Instant,
}

impl BoardContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hw: HwVersion,
        axes: Vec<Arc<Axis>>,
        board: BoardBlock,
        can: CanBlock,
        comm: CommBus,
        bus: Arc<dyn SharedBus>,
        user_config_loaded: bool,
        started_at: Instant,
    ) -> Self {
        Self {
            hw,
            axes,
            board: Mutex::new(board),
            can: Mutex::new(can),
            comm,
            bus,
            user_config_loaded: AtomicBool::new(user_config_loaded),
            fully_booted: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_at,
        }
    }

    /// Hardware revision.
    pub fn hw(&self) -> HwVersion {
        self.hw
    }

    /// Every axis, by index.
    pub fn axes(&self) -> &[Arc<Axis>] {
        &self.axes
    }

    /// One axis.
    pub fn axis(&self, index: usize) -> Option<&Arc<Axis>> {
        self.axes.get(index)
    }

    /// Board block in effect.
    pub fn board_config(&self) -> BoardBlock {
        self.board.lock().clone()
    }

    /// CAN block in effect.
    pub fn can_config(&self) -> CanBlock {
        self.can.lock().clone()
    }

    /// Interface chosen for the shared CAN/I2C pins.
    pub fn comm(&self) -> CommBus {
        self.comm
    }

    /// The arbitrated SPI bus.
    pub fn bus(&self) -> &Arc<dyn SharedBus> {
        &self.bus
    }

    /// Whether a stored configuration is in effect.
    pub fn user_config_loaded(&self) -> bool {
        self.user_config_loaded.load(Ordering::Acquire)
    }

    /// Whether every boot step completed.
    pub fn is_fully_booted(&self) -> bool {
        self.fully_booted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_fully_booted(&self) {
        self.fully_booted.store(true, Ordering::Release);
    }

    /// Flag observed by every long-running context.
    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    /// Ask every context to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Current configuration of the whole board.
    pub fn snapshot_config(&self) -> ConfigSet {
        let axes: Vec<AxisConfigSet> = self.axes.iter().map(|axis| axis.snapshot()).collect();
        let mut set = ConfigSet::defaults(self.hw);
        for (slot, axis) in set.axes.iter_mut().zip(axes) {
            *slot = axis;
        }
        set.board = self.board_config();
        set.can = self.can_config();
        set
    }

    /// Health snapshot.
    pub fn stats(&self) -> SystemStats {
        SystemStats {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            fully_booted: self.is_fully_booted(),
            user_config_loaded: self.user_config_loaded(),
            axes: self
                .axes
                .iter()
                .map(|axis| AxisStats {
                    index: axis.index(),
                    heartbeat: axis.status().heartbeat(),
                    errors: axis.status().errors().bits(),
                    running: axis.status().is_running(),
                    armed: axis.motor().is_armed(),
                    encoder_reads: axis.encoder().stats().reads(),
                    encoder_errors: axis.encoder().stats().errors(),
                })
                .collect(),
            bus: self.bus.counters(),
            min_free_bytes: None,
        }
    }
}

/// A fully booted board.
pub struct Board<P: Platform, S: ConfigStore> {
    pub(crate) ctx: Arc<BoardContext>,
    pub(crate) platform: P,
    pub(crate) nvm: Mutex<ConfigManager<S>>,
    pub(crate) hook: Arc<SafetyHook>,
    pub(crate) sampling_counter: Box<dyn SyncCounter>,
    pub(crate) analog: Option<JoinHandle<()>>,
    pub(crate) config_source: ConfigSource,
}

impl<P: Platform, S: ConfigStore> Board<P, S> {
    /// Board registry.
    pub fn context(&self) -> &Arc<BoardContext> {
        &self.ctx
    }

    /// Platform the board runs on.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Safety hook guarding the power outputs.
    pub fn safety_hook(&self) -> &Arc<SafetyHook> {
        &self.hook
    }

    /// Where the running configuration came from.
    pub fn config_source(&self) -> &ConfigSource {
        &self.config_source
    }

    /// Current count of the sampling counter.
    pub fn sampling_count(&self) -> u32 {
        self.sampling_counter.count()
    }

    /// Persist the running configuration.
    ///
    /// A failure before the write phase leaves the stored configuration
    /// untouched. Any failure clears `user_config_loaded`, since the
    /// region may no longer hold a committed configuration.
    pub fn save_configuration(&self) -> Result<(), NvmError> {
        let set = self.ctx.snapshot_config();
        if let Err(e) = store_config(&mut self.nvm.lock(), &set) {
            self.ctx.user_config_loaded.store(false, Ordering::Release);
            error!("Saving configuration failed: {}", e);
            return Err(e);
        }
        self.ctx.user_config_loaded.store(true, Ordering::Release);
        info!("Configuration saved");
        Ok(())
    }

    /// Disarm power output, wipe the stored configuration and request a
    /// restart.
    pub fn erase_configuration(&self) -> Result<Reboot, NvmError> {
        self.hook.disarm_all();
        self.nvm.lock().erase()?;
        warn!("Stored configuration erased, restart required");
        Ok(Reboot::after_erase())
    }

    /// Disarm power output and request a restart into the bootloader.
    pub fn enter_dfu_mode(&self) -> Result<Reboot, SystemError> {
        let hw = self.ctx.hw();
        if !hw.supports_dfu() {
            warn!("DFU request refused on hardware {}", hw);
            return Err(SystemError::DfuUnsupported(hw));
        }
        self.hook.disarm_all();
        info!("Rebooting into DFU mode");
        Ok(Reboot::into_dfu())
    }

    /// Disarm power output and request a plain restart.
    pub fn reboot(&self) -> Reboot {
        self.hook.disarm_all();
        Reboot::requested()
    }

    /// Idle diagnostics bound to this board.
    pub fn diagnostics(&self, probe: Arc<dyn ResourceProbe>, floor: usize) -> Diagnostics {
        Diagnostics::new(self.ctx.clone(), self.hook.clone(), probe, floor)
    }

    /// Stop every context and disarm the outputs.
    pub fn shutdown(&mut self) {
        self.ctx.request_shutdown();
        for axis in self.ctx.axes() {
            axis.join();
        }
        if let Some(handle) = self.analog.take() {
            if handle.join().is_err() {
                warn!("Analog sampling context panicked");
            }
        }
        self.hook.disarm_all();
        info!("Board stopped");
    }
}
