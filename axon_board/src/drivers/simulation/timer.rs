//! Simulated counter group.
//!
//! All counters share one [`SimTimebase`]. Time only moves when the
//! timebase is advanced, so relative phases are exact and tests are
//! deterministic.

use crate::timer::{StartTrigger, SyncCounter};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct CounterState {
    name: String,
    period: u32,
    preload: u32,
    /// Timebase tick at which counting started.
    started_at: Option<u64>,
    armed: bool,
    debug_freeze: bool,
}

#[derive(Debug, Default)]
struct Timebase {
    ticks: u64,
    counters: Vec<CounterState>,
}

/// Shared clock and start trigger of the simulated counters.
#[derive(Debug, Clone, Default)]
pub struct SimTimebase {
    inner: Arc<Mutex<Timebase>>,
}

impl SimTimebase {
    /// Fresh timebase at tick 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter driven by this timebase.
    pub fn counter(&self, name: &str, period: u32, sync_start: bool) -> SimTimer {
        let mut inner = self.inner.lock();
        inner.counters.push(CounterState {
            name: name.to_string(),
            period,
            preload: 0,
            started_at: None,
            armed: false,
            debug_freeze: false,
        });
        SimTimer {
            base: self.inner.clone(),
            index: inner.counters.len() - 1,
            name: name.to_string(),
            sync_start,
        }
    }

    /// Let `ticks` timer clocks pass.
    pub fn advance(&self, ticks: u64) {
        self.inner.lock().ticks += ticks;
    }

    /// Let `ticks` clocks pass with the core halted by a debugger.
    ///
    /// Counters configured to freeze keep their count.
    pub fn debug_halt(&self, ticks: u64) {
        let mut inner = self.inner.lock();
        for counter in inner.counters.iter_mut().filter(|c| c.debug_freeze) {
            if let Some(start) = counter.started_at.as_mut() {
                *start += ticks;
            }
        }
        inner.ticks += ticks;
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.inner.lock().ticks
    }
}

impl StartTrigger for SimTimebase {
    fn fire(&self) {
        let mut inner = self.inner.lock();
        let now = inner.ticks;
        for counter in inner.counters.iter_mut().filter(|c| c.armed) {
            counter.armed = false;
            counter.started_at = Some(now);
            trace!("{} started at tick {}", counter.name, now);
        }
    }
}

/// One simulated hardware counter.
#[derive(Debug)]
pub struct SimTimer {
    base: Arc<Mutex<Timebase>>,
    index: usize,
    name: String,
    sync_start: bool,
}

impl SimTimer {
    fn with<R>(&self, f: impl FnOnce(&mut CounterState, u64) -> R) -> R {
        let mut inner = self.base.lock();
        let now = inner.ticks;
        f(&mut inner.counters[self.index], now)
    }

    /// Whether the counter freezes on debug halt.
    pub fn debug_freeze(&self) -> bool {
        self.with(|c, _| c.debug_freeze)
    }
}

impl SyncCounter for SimTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_sync_start(&self) -> bool {
        self.sync_start
    }

    fn set_debug_freeze(&mut self, freeze: bool) {
        self.with(|c, _| c.debug_freeze = freeze);
    }

    fn stop(&mut self) {
        self.with(|c, now| {
            if let Some(start) = c.started_at.take() {
                c.preload = ((c.preload as u64 + now - start) % c.period as u64) as u32;
            }
        });
    }

    fn set_count(&mut self, count: u32) {
        self.with(|c, _| c.preload = count);
    }

    fn period(&self) -> u32 {
        self.with(|c, _| c.period)
    }

    fn arm_for_trigger(&mut self) {
        let sync_start = self.sync_start;
        self.with(|c, _| c.armed = sync_start);
    }

    fn is_running(&self) -> bool {
        self.with(|c, _| c.started_at.is_some())
    }

    fn count(&self) -> u32 {
        self.with(|c, now| match c.started_at {
            Some(start) => ((c.preload as u64 + now - start) % c.period as u64) as u32,
            None => c.preload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_on_trigger_with_preload() {
        let base = SimTimebase::new();
        let mut a = base.counter("a", 100, true);
        let mut b = base.counter("b", 100, true);
        a.set_count(40);
        b.set_count(0);
        a.arm_for_trigger();
        b.arm_for_trigger();
        base.advance(7);
        assert!(!a.is_running());

        base.fire();
        base.advance(70);
        assert_eq!(a.count(), 10);
        assert_eq!(b.count(), 70);
    }

    #[test]
    fn frozen_counter_holds_during_debug_halt() {
        let base = SimTimebase::new();
        let mut frozen = base.counter("frozen", 1000, true);
        let mut free = base.counter("free", 1000, true);
        frozen.set_debug_freeze(true);
        frozen.arm_for_trigger();
        free.arm_for_trigger();
        base.fire();
        base.advance(10);
        base.debug_halt(500);
        assert_eq!(frozen.count(), 10);
        assert_eq!(free.count(), 510);
    }

    #[test]
    fn unsupported_counter_ignores_trigger() {
        let base = SimTimebase::new();
        let mut counter = base.counter("plain", 100, false);
        counter.arm_for_trigger();
        base.fire();
        assert!(!counter.is_running());
    }
}
