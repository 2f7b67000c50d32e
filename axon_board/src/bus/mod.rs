//! Shared communication bus.
//!
//! One physical SPI bus carries the gate drivers and the absolute
//! encoders of every axis. All of them reach the peripheral through a
//! single [`BusArbiter`], which keeps at most one transfer in flight and
//! services waiters in FIFO order.
//!
//! ```text
//!  GateDriver(0) ─┐
//!  GateDriver(1) ─┤  acquire()   ┌────────────┐  begin_transfer()  ┌────────────┐
//!  Encoder(0)    ─┼─────────────►│ BusArbiter │───────────────────►│ Peripheral │
//!  Encoder(1)    ─┘              │ FIFO queue │◄───────────────────│   (IRQ)    │
//!        ▲                       └─────┬──────┘   on_complete()    └────────────┘
//!        └─── on_transfer_complete ────┘
//! ```

mod arbiter;
mod transfer;

pub use arbiter::{ArbiterStats, BusArbiter};
pub use transfer::TransferCell;

use axon_common::consts::MAX_FRAME_LEN;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// One bus frame (transmit or receive).
pub type Frame = heapless::Vec<u8, MAX_FRAME_LEN>;

/// Errors raised on the shared bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The wait queue is full; the request was not accepted.
    #[error("Bus queue full ({0} waiting)")]
    QueueFull(usize),

    /// Frame longer than the bus supports.
    #[error("Frame of {0} bytes exceeds the bus frame limit")]
    FrameTooLong(usize),

    /// The peripheral reported a transfer error.
    #[error("Peripheral error on device {device}: {reason}")]
    Peripheral {
        /// Device whose transfer failed.
        device: DeviceId,
        /// Peripheral message.
        reason: String,
    },

    /// The transfer completed with an error flag.
    #[error("Transfer failed on device {0}")]
    TransferFailed(DeviceId),

    /// No completion arrived within the caller's deadline.
    #[error("Transfer on device {0} timed out")]
    Timeout(DeviceId),
}

/// Identity of a logical device on the bus (its chip-select line).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u8);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

/// Outcome of one transfer as seen by the originating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed; receive data is valid.
    Success,
    /// Transfer failed; receive data must be ignored.
    Error,
}

/// Completion target of a bus request.
///
/// Called exactly once per accepted request, possibly from interrupt
/// context. Implementations must not block.
pub trait TransferListener: Send + Sync {
    /// The request's transfer finished.
    fn on_transfer_complete(&self, status: TransferStatus, rx: &[u8]);
}

/// One pending transfer on the bus.
pub struct BusRequest {
    /// Originating device.
    pub device: DeviceId,
    /// Bytes clocked out.
    pub tx: Frame,
    /// Completion target.
    pub listener: Arc<dyn TransferListener>,
}

impl BusRequest {
    /// Build a request, rejecting frames longer than the bus limit.
    pub fn new(
        device: DeviceId,
        tx: &[u8],
        listener: Arc<dyn TransferListener>,
    ) -> Result<Self, BusError> {
        let mut frame = Frame::new();
        frame
            .extend_from_slice(tx)
            .map_err(|_| BusError::FrameTooLong(tx.len()))?;
        Ok(Self {
            device,
            tx: frame,
            listener,
        })
    }
}

impl std::fmt::Debug for BusRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusRequest")
            .field("device", &self.device)
            .field("tx", &self.tx)
            .finish_non_exhaustive()
    }
}

/// The physical bus peripheral.
///
/// `begin_transfer` only starts the transfer. The peripheral's completion
/// interrupt must later call [`BusArbiter::on_complete`] exactly once.
pub trait BusPeripheral: Send {
    /// Assert the device's chip select and start clocking `tx`.
    fn begin_transfer(&mut self, device: DeviceId, tx: &[u8]) -> Result<(), BusError>;
}

/// Snapshot of the arbiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusCounters {
    /// Transfers handed to the peripheral.
    pub issued: u32,
    /// Transfers completed successfully.
    pub completed: u32,
    /// Transfers reported with the error flag.
    pub failed: u32,
    /// Longest wait queue observed.
    pub max_queue_len: u32,
}

/// Device-side view of the arbitrated bus.
pub trait SharedBus: Send + Sync {
    /// Enqueue a request; it is issued immediately if the bus is idle.
    fn acquire(&self, request: BusRequest) -> Result<(), BusError>;

    /// Arbiter counters, if the bus keeps any.
    fn counters(&self) -> BusCounters {
        BusCounters::default()
    }
}
