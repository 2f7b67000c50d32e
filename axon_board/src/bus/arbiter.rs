//! FIFO arbiter for the shared bus.
//!
//! Queue mutation happens inside one short critical section shared by
//! `acquire` (thread context) and `on_complete` (interrupt context).
//! Listeners are always called outside the critical section so they may
//! re-acquire the bus from their completion handler.

use super::{BusCounters, BusError, BusPeripheral, BusRequest, SharedBus, TransferStatus};
use axon_common::consts::BUS_QUEUE_DEPTH;
use heapless::Deque;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Counters maintained by the arbiter.
#[derive(Debug, Default)]
pub struct ArbiterStats {
    issued: AtomicU32,
    completed: AtomicU32,
    failed: AtomicU32,
    max_queue_len: AtomicU32,
}

impl ArbiterStats {
    /// Transfers handed to the peripheral.
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Transfers completed successfully.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Transfers reported to their device with the error flag.
    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Longest wait queue observed.
    pub fn max_queue_len(&self) -> u32 {
        self.max_queue_len.load(Ordering::Relaxed)
    }

    /// Copy of every counter.
    pub fn snapshot(&self) -> BusCounters {
        BusCounters {
            issued: self.issued(),
            completed: self.completed(),
            failed: self.failed(),
            max_queue_len: self.max_queue_len(),
        }
    }
}

struct ArbiterInner<P> {
    peripheral: P,
    /// Request whose transfer is on the wire.
    active: Option<BusRequest>,
    /// A completion is being delivered; the bus is still owned.
    completing: bool,
    queue: Deque<BusRequest, BUS_QUEUE_DEPTH>,
}

impl<P> ArbiterInner<P> {
    fn is_busy(&self) -> bool {
        self.active.is_some() || self.completing
    }
}

/// Mutual-exclusion scheduler for one physical bus.
///
/// No priority handling: every device on the bus has comparable urgency,
/// so waiters are served strictly first come, first served.
pub struct BusArbiter<P: BusPeripheral> {
    inner: Mutex<ArbiterInner<P>>,
    stats: ArbiterStats,
}

impl<P: BusPeripheral> BusArbiter<P> {
    /// Take exclusive ownership of the peripheral.
    pub fn new(peripheral: P) -> Self {
        Self {
            inner: Mutex::new(ArbiterInner {
                peripheral,
                active: None,
                completing: false,
                queue: Deque::new(),
            }),
            stats: ArbiterStats::default(),
        }
    }

    /// Enqueue a request.
    ///
    /// Issued immediately when the bus is idle, queued otherwise. Every
    /// accepted request receives exactly one completion. A request that
    /// is rejected with [`BusError::QueueFull`] receives none.
    pub fn acquire(&self, request: BusRequest) -> Result<(), BusError> {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.is_busy() {
                let waiting = inner.queue.len();
                inner
                    .queue
                    .push_back(request)
                    .map_err(|_| BusError::QueueFull(waiting))?;
                self.stats
                    .max_queue_len
                    .fetch_max(inner.queue.len() as u32, Ordering::Relaxed);
                return Ok(());
            }
            match self.start(&mut inner, request) {
                Ok(()) => return Ok(()),
                Err(request) => request,
            }
        };
        self.fail(rejected);
        Ok(())
    }

    /// Completion of the in-flight transfer, called from the bus IRQ.
    ///
    /// Notifies the originating device, then issues the next waiter.
    /// Never blocks beyond the arbiter's critical section.
    pub fn on_complete(&self, outcome: Result<&[u8], BusError>) {
        let finished = {
            let mut inner = self.inner.lock();
            let Some(request) = inner.active.take() else {
                warn!("Spurious bus completion with no transfer in flight");
                return;
            };
            inner.completing = true;
            request
        };

        match outcome {
            Ok(rx) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                finished
                    .listener
                    .on_transfer_complete(TransferStatus::Success, rx);
            }
            Err(e) => {
                debug!("Transfer on {} failed: {}", finished.device, e);
                self.fail(finished);
            }
        }

        self.issue_next();
    }

    /// Whether a transfer is in flight or being completed.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().is_busy()
    }

    /// Number of requests waiting behind the active one.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Arbiter counters.
    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    /// Run `f` with the peripheral while holding the critical section.
    pub fn with_peripheral<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.inner.lock().peripheral)
    }

    fn issue_next(&self) {
        loop {
            let rejected = {
                let mut inner = self.inner.lock();
                let Some(next) = inner.queue.pop_front() else {
                    inner.completing = false;
                    return;
                };
                match self.start(&mut inner, next) {
                    Ok(()) => {
                        inner.completing = false;
                        return;
                    }
                    Err(request) => request,
                }
            };
            // Keep `completing` set so nobody jumps the queue meanwhile.
            self.fail(rejected);
        }
    }

    /// Hand a request to the peripheral. Gives the request back on failure.
    fn start(&self, inner: &mut ArbiterInner<P>, request: BusRequest) -> Result<(), BusRequest> {
        match inner.peripheral.begin_transfer(request.device, &request.tx) {
            Ok(()) => {
                self.stats.issued.fetch_add(1, Ordering::Relaxed);
                inner.active = Some(request);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to start transfer on {}: {}", request.device, e);
                Err(request)
            }
        }
    }

    fn fail(&self, request: BusRequest) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        request
            .listener
            .on_transfer_complete(TransferStatus::Error, &[]);
    }
}

impl<P: BusPeripheral> SharedBus for BusArbiter<P> {
    fn acquire(&self, request: BusRequest) -> Result<(), BusError> {
        BusArbiter::acquire(self, request)
    }

    fn counters(&self) -> BusCounters {
        self.stats.snapshot()
    }
}
