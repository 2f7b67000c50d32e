//! Non-volatile configuration storage.
//!
//! - [`store`] - the raw byte-range [`ConfigStore`] boundary
//! - [`format`] - on-media region header and record layout
//! - [`manager`] - the two-phase [`ConfigManager`] transaction state machine
//! - [`persist`] - whole-[`ConfigSet`](axon_common::layout::ConfigSet) store, load and
//!   fallback to defaults
//!
//! # Region layout
//!
//! ```text
//! offset 0                 20
//!        ┌─────────────────┬──────────┬─────────┬──────────┬─────────┬───
//!        │  RegionHeader   │ Record 0 │ block 0 │ Record 1 │ block 1 │ ...
//!        │ (written last)  │  8 bytes │         │  8 bytes │         │
//!        └─────────────────┴──────────┴─────────┴──────────┴─────────┴───
//! ```
//!
//! The header is only written by `finish_store`, after every record. A
//! store interrupted at any earlier point leaves an erased header, which
//! `start_load` rejects.

pub mod format;
pub mod manager;
pub mod persist;
pub mod store;

pub use manager::{ConfigManager, TransactionState};
pub use persist::{load_config, load_or_default, store_config, ConfigSource, LoadedConfig};
pub use store::ConfigStore;

use axon_common::layout::{LayoutError, Slot};
use thiserror::Error;

/// Errors raised by the configuration storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvmError {
    /// The backing medium failed.
    #[error("NVM I/O error: {0}")]
    Io(String),

    /// Write targets bytes that were not erased first.
    #[error("Write to non-erased NVM at offset {offset}")]
    NotErased {
        /// First non-erased byte.
        offset: usize,
    },

    /// Access falls outside the region.
    #[error("NVM access of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        /// Start of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Region capacity.
        capacity: usize,
    },

    /// The full block schema does not fit the region.
    #[error("Configuration needs {required} bytes but NVM holds {capacity}")]
    CapacityExceeded {
        /// Bytes needed for header, records and payload.
        required: usize,
        /// Region capacity.
        capacity: usize,
    },

    /// The backing medium has a different size than configured.
    #[error("NVM medium holds {found} bytes, configured capacity is {expected}")]
    CapacityMismatch {
        /// Configured capacity.
        expected: usize,
        /// Size of the existing medium.
        found: usize,
    },

    /// Operation not valid in the current transaction state.
    #[error("Operation {operation} not allowed in state {state:?}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Transaction state at the time.
        state: TransactionState,
    },

    /// Block pushed or popped out of schema order.
    #[error("Expected slot {expected}, got {actual}")]
    LayoutMismatch {
        /// Slot the schema requires next.
        expected: Slot,
        /// Slot supplied by the caller.
        actual: Slot,
    },

    /// Phase ended before every slot of the schema was handled.
    #[error("Sequence incomplete: {done} of {total} blocks")]
    IncompleteSequence {
        /// Blocks handled so far.
        done: usize,
        /// Blocks in the schema.
        total: usize,
    },

    /// Second store pass differs from the staged first pass.
    #[error("Block {0} changed between staging and write")]
    StagingMismatch(Slot),

    /// The region holds no committed configuration.
    #[error("No valid configuration stored")]
    NoValidConfig,

    /// A checksum, tag or length check failed.
    #[error("Stored configuration corrupted: {0}")]
    Corrupted(String),

    /// Stored data was written by a different schema.
    #[error("Stored schema version {found}, expected {expected}")]
    SchemaMismatch {
        /// Version this build writes.
        expected: u16,
        /// Version found in storage.
        found: u16,
    },

    /// Block encoding or decoding failed.
    #[error(transparent)]
    Layout(#[from] LayoutError),
}
