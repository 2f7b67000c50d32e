//! System-level requests and idle diagnostics.
//!
//! - [`Reboot`] - mandatory restart requests (after erase, into DFU)
//! - [`SystemStats`] - snapshot collected by the idle context
//! - [`Diagnostics`] - idle-time sampling, gated on `fully_booted`

use crate::boot::BoardContext;
use crate::bus::BusCounters;
use crate::nvm::NvmError;
use crate::safety::SafetyHook;
use axon_common::consts::DFU_REBOOT_COOKIE;
use axon_common::hw::HwVersion;
use serde::Serialize;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors of system-level requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SystemError {
    /// DFU reboot is not safe on this hardware revision.
    #[error("DFU mode not supported on hardware {0}")]
    DfuUnsupported(HwVersion),

    /// Configuration storage failed.
    #[error(transparent)]
    Nvm(#[from] NvmError),
}

/// Why the board must restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebootReason {
    /// Stored configuration was erased.
    ConfigErased,
    /// Restart into the bootloader.
    EnterDfu,
    /// Explicit reboot request.
    Requested,
}

/// A pending system restart.
///
/// Power output is already disarmed when this is returned. The caller
/// must restart the process; continuing to run is not allowed.
#[must_use = "the board must restart after this request"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reboot {
    /// Why the restart is needed.
    pub reason: RebootReason,
    /// Cookie left for the bootloader.
    pub cookie: Option<u32>,
}

impl Reboot {
    /// Restart after the configuration region was wiped.
    pub fn after_erase() -> Self {
        Self {
            reason: RebootReason::ConfigErased,
            cookie: None,
        }
    }

    /// Restart into DFU mode.
    pub fn into_dfu() -> Self {
        Self {
            reason: RebootReason::EnterDfu,
            cookie: Some(DFU_REBOOT_COOKIE),
        }
    }

    /// Plain restart.
    pub fn requested() -> Self {
        Self {
            reason: RebootReason::Requested,
            cookie: None,
        }
    }
}

/// Per-axis part of [`SystemStats`].
#[derive(Debug, Clone, Serialize)]
pub struct AxisStats {
    /// Axis index.
    pub index: usize,
    /// Iterations of the axis context.
    pub heartbeat: u64,
    /// Latched error flags.
    pub errors: u32,
    /// Axis context is running.
    pub running: bool,
    /// PWM output enabled.
    pub armed: bool,
    /// Encoder frames accepted.
    pub encoder_reads: u32,
    /// Encoder frames rejected.
    pub encoder_errors: u32,
}

/// Snapshot of board health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Time since boot started [ms].
    pub uptime_ms: u64,
    /// Every boot step completed.
    pub fully_booted: bool,
    /// A stored configuration is in effect.
    pub user_config_loaded: bool,
    /// Per-axis counters.
    pub axes: Vec<AxisStats>,
    /// Shared bus counters.
    pub bus: BusCounters,
    /// Lowest free memory seen by the resource probe [bytes].
    pub min_free_bytes: Option<usize>,
}

/// Source of memory headroom readings.
pub trait ResourceProbe: Send + Sync {
    /// Free memory right now [bytes].
    fn free_bytes(&self) -> usize;
}

/// Idle-time diagnostics.
///
/// Collects [`SystemStats`] once the board is fully booted and trips the
/// safety hook when memory headroom falls below the floor.
pub struct Diagnostics {
    ctx: Arc<BoardContext>,
    hook: Arc<SafetyHook>,
    probe: Arc<dyn ResourceProbe>,
    floor: usize,
    min_free: Option<usize>,
}

impl Diagnostics {
    /// Create diagnostics with a headroom floor in bytes.
    pub fn new(
        ctx: Arc<BoardContext>,
        hook: Arc<SafetyHook>,
        probe: Arc<dyn ResourceProbe>,
        floor: usize,
    ) -> Self {
        Self {
            ctx,
            hook,
            probe,
            floor,
            min_free: None,
        }
    }

    /// Free memory below the floor, if any.
    pub fn check_headroom(&mut self) -> Option<usize> {
        let free = self.probe.free_bytes();
        self.min_free = Some(self.min_free.map_or(free, |min| min.min(free)));
        (free < self.floor).then_some(free)
    }

    /// One idle iteration.
    ///
    /// Returns `None` until the board is fully booted. Exhausted headroom
    /// disarms all power output and halts.
    pub fn tick(&mut self) -> Option<SystemStats> {
        if !self.ctx.is_fully_booted() {
            return None;
        }
        if let Some(free) = self.check_headroom() {
            self.hook.on_resource_exhaustion(&format!(
                "free memory {} bytes below floor {}",
                free, self.floor
            ));
        }
        let mut stats = self.ctx.stats();
        stats.min_free_bytes = self.min_free;
        Some(stats)
    }

    /// Run [`tick`](Self::tick) every `period` until shutdown.
    pub fn spawn(mut self, period: Duration) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("diagnostics".to_string())
            .spawn(move || {
                while !self.ctx.shutdown_flag().load(Ordering::Acquire) {
                    if let Some(stats) = self.tick() {
                        debug!(
                            "uptime {} ms, bus {}/{} ok, {} failed",
                            stats.uptime_ms,
                            stats.bus.completed,
                            stats.bus.issued,
                            stats.bus.failed
                        );
                        for axis in stats.axes.iter().filter(|a| a.errors != 0) {
                            warn!("Axis {} errors {:#06x}", axis.index, axis.errors);
                        }
                    }
                    thread::sleep(period);
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::CommBus;
    use crate::bus::{BusError, BusRequest, SharedBus};
    use crate::safety::PowerStage;
    use axon_common::blocks::{BoardBlock, CanBlock};
    use std::time::Instant;

    struct NullBus;

    impl SharedBus for NullBus {
        fn acquire(&self, _request: BusRequest) -> Result<(), BusError> {
            Ok(())
        }
    }

    struct NullPower;

    impl PowerStage for NullPower {
        fn enable(&self) {}
        fn is_enabled(&self) -> bool {
            false
        }
        fn disarm_brake_resistor(&self) {}
        fn halt(&self) -> ! {
            panic!("halted")
        }
    }

    struct FixedProbe(usize);

    impl ResourceProbe for FixedProbe {
        fn free_bytes(&self) -> usize {
            self.0
        }
    }

    fn diagnostics(free: usize) -> (Arc<BoardContext>, Diagnostics) {
        let ctx = Arc::new(BoardContext::new(
            HwVersion::V3_6,
            Vec::new(),
            BoardBlock::default(),
            CanBlock::default(),
            CommBus::Can,
            Arc::new(NullBus),
            false,
            Instant::now(),
        ));
        let hook = Arc::new(SafetyHook::new(Arc::new(NullPower)));
        let diag = Diagnostics::new(ctx.clone(), hook, Arc::new(FixedProbe(free)), 1024);
        (ctx, diag)
    }

    #[test]
    fn stats_gated_until_fully_booted() {
        let (ctx, mut diag) = diagnostics(4096);
        assert!(diag.tick().is_none());

        ctx.mark_fully_booted();
        let stats = diag.tick().unwrap();
        assert!(stats.fully_booted);
        assert_eq!(stats.min_free_bytes, Some(4096));
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn exhausted_headroom_halts() {
        let (ctx, mut diag) = diagnostics(100);
        ctx.mark_fully_booted();
        diag.tick();
    }

    #[test]
    fn headroom_check_runs_before_boot_completes() {
        let (_ctx, mut diag) = diagnostics(100);
        assert_eq!(diag.check_headroom(), Some(100));
        assert!(diag.tick().is_none());
    }

    #[test]
    fn dfu_reboot_carries_cookie() {
        assert_eq!(Reboot::into_dfu().cookie, Some(0xDEAD_BEEF));
        assert_eq!(Reboot::after_erase().cookie, None);
        assert_eq!(Reboot::after_erase().reason, RebootReason::ConfigErased);
    }
}
