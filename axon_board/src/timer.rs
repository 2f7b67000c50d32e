//! Synchronized start of the PWM and sampling counters.
//!
//! The two motor PWM counters and the ADC sampling counter must run with
//! a fixed relative phase from their first cycle. Starting them one after
//! another would skew them by the instruction latency between starts, so
//! all counters are preloaded while stopped, armed on a shared start
//! trigger, and released by a single trigger event.
//!
//! ```text
//!            preload offsets          trigger
//!  PWM0  ──stop──[P/2-128]──arm──────────┼──▶ running
//!  PWM1  ──stop──[0]────────arm──────────┼──▶ running
//!  ADC   ──stop──[P/2-128]──arm──────────┼──▶ running
//! ```

use axon_common::consts::{TIM_1_8_PERIOD_CLOCKS, TIM_SAMPLING_LEAD_CLOCKS, TIMER_GROUP_SIZE};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while starting a counter group.
///
/// All of them are configuration mismatches between firmware and
/// hardware. None is recoverable at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// The counter cannot be started from the shared trigger.
    #[error("Counter {counter} does not support synchronized start")]
    SyncStartUnsupported {
        /// Counter name.
        counter: String,
    },

    /// Initial count does not fit the counter period.
    #[error("Offset {offset} out of range for counter {counter} with period {period}")]
    OffsetOutOfRange {
        /// Counter name.
        counter: String,
        /// Requested initial count.
        offset: u32,
        /// Counter period.
        period: u32,
    },

    /// The counter did not start on the trigger.
    #[error("Counter {counter} did not start on the shared trigger")]
    NotRunning {
        /// Counter name.
        counter: String,
    },
}

/// One hardware counter that can take part in a synchronized start.
pub trait SyncCounter: Send {
    /// Counter name for logs and errors.
    fn name(&self) -> &str;

    /// Whether the counter can be started from the shared trigger.
    fn supports_sync_start(&self) -> bool;

    /// Freeze the counter while the core is halted by a debugger.
    fn set_debug_freeze(&mut self, freeze: bool);

    /// Stop counting.
    fn stop(&mut self);

    /// Load the count register.
    fn set_count(&mut self, count: u32);

    /// Counter period in timer clocks.
    fn period(&self) -> u32;

    /// Make the next shared trigger start this counter.
    fn arm_for_trigger(&mut self);

    /// Whether the counter is running.
    fn is_running(&self) -> bool;

    /// Current count register value.
    fn count(&self) -> u32;
}

/// The shared start trigger of a counter group.
pub trait StartTrigger {
    /// Start every armed counter on the same clock edge.
    fn fire(&self);
}

/// Counters and their initial counts, consumed by one synchronized start.
pub struct TimerGroup<C: SyncCounter, const N: usize> {
    counters: [C; N],
    offsets: [u32; N],
}

impl<C: SyncCounter, const N: usize> TimerGroup<C, N> {
    /// Pair each counter with its initial count.
    pub fn new(counters: [C; N], offsets: [u32; N]) -> Self {
        Self { counters, offsets }
    }

    /// Initial counts in group order.
    pub fn offsets(&self) -> &[u32; N] {
        &self.offsets
    }

    /// Preload every counter and release the whole group with one trigger.
    ///
    /// On success ownership of each started counter passes back to the
    /// caller, which hands them to their axes. Every error is fatal.
    pub fn start_synchronously(
        mut self,
        trigger: &dyn StartTrigger,
    ) -> Result<[C; N], TimerError> {
        for (counter, &offset) in self.counters.iter().zip(self.offsets.iter()) {
            if !counter.supports_sync_start() {
                return Err(TimerError::SyncStartUnsupported {
                    counter: counter.name().to_string(),
                });
            }
            if offset >= counter.period() {
                return Err(TimerError::OffsetOutOfRange {
                    counter: counter.name().to_string(),
                    offset,
                    period: counter.period(),
                });
            }
        }

        for counter in self.counters.iter_mut() {
            counter.stop();
        }
        for (counter, &offset) in self.counters.iter_mut().zip(self.offsets.iter()) {
            counter.set_count(offset);
            counter.arm_for_trigger();
            debug!("Counter {} preloaded with {}", counter.name(), offset);
        }

        trigger.fire();

        if let Some(stalled) = self.counters.iter().find(|c| !c.is_running()) {
            return Err(TimerError::NotRunning {
                counter: stalled.name().to_string(),
            });
        }

        info!("{} counters started synchronously", N);
        Ok(self.counters)
    }
}

/// Initial counts of the board's counter group: axis 0 PWM, axis 1 PWM,
/// sampling counter.
///
/// Axis 0 leads axis 1 by half a period so their current ripple cancels.
/// The sampling counter is aligned with axis 0 minus a small lead.
pub const fn board_offsets() -> [u32; TIMER_GROUP_SIZE] {
    let half = TIM_1_8_PERIOD_CLOCKS / 2 - TIM_SAMPLING_LEAD_CLOCKS;
    [half, 0, half]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeCounter {
        name: &'static str,
        sync: bool,
        count: u32,
        armed: bool,
        running: bool,
        fired: Arc<AtomicBool>,
    }

    impl FakeCounter {
        fn new(name: &'static str, fired: &Arc<AtomicBool>) -> Self {
            Self {
                name,
                sync: true,
                count: 17,
                armed: false,
                running: true,
                fired: fired.clone(),
            }
        }
    }

    impl SyncCounter for FakeCounter {
        fn name(&self) -> &str {
            self.name
        }
        fn supports_sync_start(&self) -> bool {
            self.sync
        }
        fn set_debug_freeze(&mut self, _freeze: bool) {}
        fn stop(&mut self) {
            self.running = false;
        }
        fn set_count(&mut self, count: u32) {
            self.count = count;
        }
        fn period(&self) -> u32 {
            TIM_1_8_PERIOD_CLOCKS
        }
        fn arm_for_trigger(&mut self) {
            self.armed = true;
        }
        fn is_running(&self) -> bool {
            self.running || (self.armed && self.fired.load(Ordering::SeqCst))
        }
        fn count(&self) -> u32 {
            self.count
        }
    }

    struct FlagTrigger {
        fired: Arc<AtomicBool>,
        shots: Cell<u32>,
    }

    impl StartTrigger for FlagTrigger {
        fn fire(&self) {
            self.shots.set(self.shots.get() + 1);
            self.fired.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn board_offsets_match_period() {
        assert_eq!(board_offsets(), [1622, 0, 1622]);
    }

    #[test]
    fn group_starts_with_one_trigger() {
        let fired = Arc::new(AtomicBool::new(false));
        let trigger = FlagTrigger {
            fired: fired.clone(),
            shots: Cell::new(0),
        };
        let group = TimerGroup::new(
            [
                FakeCounter::new("pwm0", &fired),
                FakeCounter::new("pwm1", &fired),
                FakeCounter::new("adc", &fired),
            ],
            board_offsets(),
        );

        let counters = group.start_synchronously(&trigger).unwrap();
        assert_eq!(trigger.shots.get(), 1);
        let counts: Vec<u32> = counters.iter().map(|c| c.count()).collect();
        assert_eq!(counts, board_offsets().to_vec());
    }

    #[test]
    fn unsupported_counter_fails_before_touching_group() {
        let fired = Arc::new(AtomicBool::new(false));
        let trigger = FlagTrigger {
            fired: fired.clone(),
            shots: Cell::new(0),
        };
        let mut adc = FakeCounter::new("adc", &fired);
        adc.sync = false;
        let group = TimerGroup::new([FakeCounter::new("pwm0", &fired), adc], [0, 0]);

        let err = group.start_synchronously(&trigger).err();
        assert_eq!(
            err,
            Some(TimerError::SyncStartUnsupported {
                counter: "adc".to_string()
            })
        );
        assert_eq!(trigger.shots.get(), 0);
    }

    #[test]
    fn offset_beyond_period_rejected() {
        let fired = Arc::new(AtomicBool::new(false));
        let trigger = FlagTrigger {
            fired: fired.clone(),
            shots: Cell::new(0),
        };
        let group = TimerGroup::new([FakeCounter::new("pwm0", &fired)], [TIM_1_8_PERIOD_CLOCKS]);
        assert!(matches!(
            group.start_synchronously(&trigger),
            Err(TimerError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn counter_that_ignores_trigger_reported() {
        struct DeadTrigger;
        impl StartTrigger for DeadTrigger {
            fn fire(&self) {}
        }
        let fired = Arc::new(AtomicBool::new(false));
        let group = TimerGroup::new([FakeCounter::new("pwm0", &fired)], [0]);
        assert!(matches!(
            group.start_synchronously(&DeadTrigger),
            Err(TimerError::NotRunning { .. })
        ));
    }
}
