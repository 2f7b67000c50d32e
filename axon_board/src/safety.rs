//! Last-resort safety shutdown.
//!
//! When the firmware can no longer trust its own execution (stack
//! overflow, heap exhaustion) it disarms every power output and halts.
//! It never restarts by itself: restarting power electronics from an
//! unknown state is not safe.

use crate::axis::{Axis, AxisErrors};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::error;

/// Board-level power outputs outside the motors.
pub trait PowerStage: Send + Sync {
    /// Enable PWM generation and the sampling interrupts.
    fn enable(&self);

    /// Whether PWM generation is enabled.
    fn is_enabled(&self) -> bool;

    /// Turn off the brake resistor.
    fn disarm_brake_resistor(&self);

    /// Stop the processor. Never returns.
    fn halt(&self) -> !;
}

/// Disarms all power output on fatal runtime faults.
pub struct SafetyHook {
    power: Arc<dyn PowerStage>,
    axes: OnceLock<Vec<Arc<Axis>>>,
    tripped: AtomicBool,
}

impl SafetyHook {
    /// Hook guarding `power`. Axes are attached once constructed.
    pub fn new(power: Arc<dyn PowerStage>) -> Self {
        Self {
            power,
            axes: OnceLock::new(),
            tripped: AtomicBool::new(false),
        }
    }

    /// Register the axes whose motors must be disarmed. Only the first
    /// call has an effect.
    pub fn attach_axes(&self, axes: Vec<Arc<Axis>>) {
        let _ = self.axes.set(axes);
    }

    /// Disarm every motor and the brake resistor, and latch.
    ///
    /// Returns `true` on the first trip.
    pub fn trip(&self, reason: &str) -> bool {
        self.disarm_all();
        let first = !self.tripped.swap(true, Ordering::AcqRel);
        if first {
            error!("Safety shutdown: {}", reason);
        }
        first
    }

    /// Disarm every output without latching.
    pub fn disarm_all(&self) {
        if let Some(axes) = self.axes.get() {
            for axis in axes {
                axis.motor().safety_critical_disarm();
                axis.status().raise(AxisErrors::SAFETY_DISARMED);
            }
        }
        self.power.disarm_brake_resistor();
    }

    /// Whether the hook has tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Stack or heap exhausted: disarm and halt.
    pub fn on_resource_exhaustion(&self, reason: &str) -> ! {
        self.trip(reason);
        self.power.halt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Brake {
        armed: AtomicBool,
    }

    impl PowerStage for Brake {
        fn enable(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
        fn is_enabled(&self) -> bool {
            self.armed.load(Ordering::SeqCst)
        }
        fn disarm_brake_resistor(&self) {
            self.armed.store(false, Ordering::SeqCst);
        }
        fn halt(&self) -> ! {
            panic!("halted")
        }
    }

    #[test]
    fn trip_latches_and_disarms_brake() {
        let brake = Arc::new(Brake::default());
        brake.enable();
        let hook = SafetyHook::new(brake.clone());

        assert!(hook.trip("heap exhausted"));
        assert!(hook.is_tripped());
        assert!(!brake.is_enabled());

        brake.enable();
        assert!(!hook.trip("again"));
        assert!(!brake.is_enabled());
    }

    #[test]
    fn disarm_all_does_not_latch() {
        let hook = SafetyHook::new(Arc::new(Brake::default()));
        hook.disarm_all();
        assert!(!hook.is_tripped());
    }
}
