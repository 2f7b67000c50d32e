//! Single-slot completion mailbox for blocking transfers.
//!
//! Setup code runs in thread context and may wait for its transfer with
//! a bounded timeout. Steady-state code never waits; it uses its own
//! [`TransferListener`] instead.

use super::{BusError, BusRequest, DeviceId, Frame, SharedBus, TransferListener, TransferStatus};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
enum Slot {
    Idle,
    /// Waiting for the completion of transfer `generation`.
    Pending(u32),
    Done { status: TransferStatus, rx: Frame },
}

/// Completion mailbox holding the result of one outstanding transfer.
///
/// Every transfer carries its own generation number, so a completion
/// that arrives after its caller timed out cannot satisfy a later call.
#[derive(Debug)]
pub struct TransferCell {
    slot: Mutex<Slot>,
    ready: Condvar,
    generation: AtomicU32,
}

impl Default for TransferCell {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            ready: Condvar::new(),
            generation: AtomicU32::new(0),
        }
    }
}

/// Listener bound to one transfer of a [`TransferCell`].
struct Ticket {
    cell: Arc<TransferCell>,
    generation: u32,
}

impl TransferListener for Ticket {
    fn on_transfer_complete(&self, status: TransferStatus, rx: &[u8]) {
        self.cell.complete(self.generation, status, rx);
    }
}

impl TransferCell {
    /// Create an idle mailbox.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue `tx` to `device` and wait up to `timeout` for its completion.
    ///
    /// Returns the received frame on success. Completions of earlier,
    /// timed-out transfers are discarded.
    pub fn transfer_blocking(
        self: &Arc<Self>,
        bus: &dyn SharedBus,
        device: DeviceId,
        tx: &[u8],
        timeout: Duration,
    ) -> Result<Frame, BusError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let ticket = Arc::new(Ticket {
            cell: self.clone(),
            generation,
        });
        let request = BusRequest::new(device, tx, ticket)?;

        *self.slot.lock() = Slot::Pending(generation);
        if let Err(e) = bus.acquire(request) {
            *self.slot.lock() = Slot::Idle;
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Done { status, rx } => {
                    return match status {
                        TransferStatus::Success => Ok(rx),
                        TransferStatus::Error => Err(BusError::TransferFailed(device)),
                    };
                }
                waiting => *slot = waiting,
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out()
                && !matches!(*slot, Slot::Done { .. })
            {
                *slot = Slot::Idle;
                return Err(BusError::Timeout(device));
            }
        }
    }

    fn complete(&self, generation: u32, status: TransferStatus, rx: &[u8]) {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending(pending) if pending == generation) {
            debug!("Dropping stale completion of transfer {}", generation);
            return;
        }
        let mut frame = Frame::new();
        // Frames never exceed the request's own length.
        let _ = frame.extend_from_slice(&rx[..rx.len().min(frame.capacity())]);
        *slot = Slot::Done { status, rx: frame };
        self.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus completing every request inline with a fixed response.
    struct EchoBus {
        status: TransferStatus,
    }

    impl SharedBus for EchoBus {
        fn acquire(&self, request: BusRequest) -> Result<(), BusError> {
            let rx: Vec<u8> = request.tx.iter().map(|b| !b).collect();
            request.listener.on_transfer_complete(self.status, &rx);
            Ok(())
        }
    }

    struct SilentBus;

    impl SharedBus for SilentBus {
        fn acquire(&self, _request: BusRequest) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[test]
    fn inline_completion_returns_frame() {
        let cell = TransferCell::new();
        let bus = EchoBus {
            status: TransferStatus::Success,
        };
        let rx = cell
            .transfer_blocking(&bus, DeviceId(3), &[0x0F, 0xF0], Duration::from_millis(10))
            .unwrap();
        assert_eq!(rx.as_slice(), &[0xF0, 0x0F]);
    }

    #[test]
    fn error_completion_maps_to_transfer_failed() {
        let cell = TransferCell::new();
        let bus = EchoBus {
            status: TransferStatus::Error,
        };
        let err = cell
            .transfer_blocking(&bus, DeviceId(3), &[0, 0], Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, BusError::TransferFailed(DeviceId(3)));
    }

    /// Bus that holds every request until `release` completes them in
    /// arrival order, answering each with its own first tx byte.
    #[derive(Default)]
    struct HeldBus {
        held: Mutex<Vec<BusRequest>>,
    }

    impl HeldBus {
        fn release(&self) {
            for request in self.held.lock().drain(..) {
                let tag = request.tx[0];
                request
                    .listener
                    .on_transfer_complete(TransferStatus::Success, &[tag, tag]);
            }
        }
    }

    impl SharedBus for HeldBus {
        fn acquire(&self, request: BusRequest) -> Result<(), BusError> {
            self.held.lock().push(request);
            Ok(())
        }
    }

    #[test]
    fn missing_completion_times_out() {
        let cell = TransferCell::new();
        let err = cell
            .transfer_blocking(&SilentBus, DeviceId(1), &[0, 0], Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err, BusError::Timeout(DeviceId(1)));
        assert!(matches!(*cell.slot.lock(), Slot::Idle));
    }

    #[test]
    fn late_completion_never_answers_next_transfer() {
        let cell = TransferCell::new();
        let bus = Arc::new(HeldBus::default());

        let err = cell
            .transfer_blocking(bus.as_ref(), DeviceId(1), &[1, 0], Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err, BusError::Timeout(DeviceId(1)));

        // The stale reply to the first transfer is delivered first.
        let releaser = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                bus.release();
            })
        };
        let rx = cell
            .transfer_blocking(bus.as_ref(), DeviceId(1), &[2, 0], Duration::from_secs(1))
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(rx.as_slice(), &[2, 2]);
    }

    #[test]
    fn completion_from_other_thread_wakes_waiter() {
        struct ThreadBus;
        impl SharedBus for ThreadBus {
            fn acquire(&self, request: BusRequest) -> Result<(), BusError> {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(2));
                    request
                        .listener
                        .on_transfer_complete(TransferStatus::Success, &[0xAB, 0xCD]);
                });
                Ok(())
            }
        }

        let cell = TransferCell::new();
        let rx = cell
            .transfer_blocking(&ThreadBus, DeviceId(0), &[0, 0], Duration::from_secs(1))
            .unwrap();
        assert_eq!(rx.as_slice(), &[0xAB, 0xCD]);
    }
}
