//! Two-phase configuration transaction over a [`ConfigStore`].
//!
//! Store: `prepare_store` → first `push` pass (staging only) →
//! `start_store` (erase) → second `push` pass (records) → `finish_store`
//! (region header). Load: `start_load` → `pop` pass → `finish_load`.
//!
//! ```text
//!            prepare_store        start_store           finish_store
//!   Idle ───────────────▶ Preparing ─────────▶ StoreInProgress ────────▶ Committed
//!     │
//!     │   start_load                 finish_load
//!     └────────────▶ LoadInProgress ────────────▶ Loaded
//! ```
//!
//! Any failure returns the manager to `Idle`. Storage is only mutated
//! between `start_store` and `finish_store`.

use super::NvmError;
use super::format::{Crc32, RecordHeader, RegionHeader};
use super::store::ConfigStore;
use axon_common::layout::{
    min_nvm_capacity, schema_payload_len, LayoutError, Slot, CONFIG_SCHEMA, NVM_HEADER_LEN,
    NVM_RECORD_HEADER_LEN, SCHEMA_VERSION, SLOT_COUNT,
};
use std::ops::Range;
use tracing::{debug, info, warn};

/// Phase of the current store or load session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No session open.
    Idle,
    /// Store session: first pass, blocks are staged in memory.
    Preparing,
    /// Store session: region erased, second pass writes records.
    StoreInProgress,
    /// Last store committed.
    Committed,
    /// Load session open, records being popped.
    LoadInProgress,
    /// Last load completed.
    Loaded,
}

impl TransactionState {
    /// Whether a session is open.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransactionState::Preparing
                | TransactionState::StoreInProgress
                | TransactionState::LoadInProgress
        )
    }
}

/// Exclusive owner of the configuration region.
///
/// One session at a time; every method takes `&mut self`, so sessions
/// cannot interleave.
pub struct ConfigManager<S: ConfigStore> {
    store: S,
    state: TransactionState,
    /// Index into `CONFIG_SCHEMA` of the next block.
    cursor: usize,
    /// Blocks accepted by the first store pass.
    staged: Vec<Vec<u8>>,
    write_offset: usize,
    payload_crc: Crc32,
    /// Record bytes of the open load session.
    payload: Vec<u8>,
    read_offset: usize,
}

impl<S: ConfigStore> ConfigManager<S> {
    /// Take ownership of the region.
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: TransactionState::Idle,
            cursor: 0,
            staged: Vec::with_capacity(SLOT_COUNT),
            write_offset: NVM_HEADER_LEN,
            payload_crc: Crc32::new(),
            payload: Vec::new(),
            read_offset: 0,
        }
    }

    /// Current session phase.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Open a store session. Checks capacity; writes nothing.
    pub fn prepare_store(&mut self) -> Result<(), NvmError> {
        self.require_closed("prepare_store")?;
        let required = min_nvm_capacity();
        let capacity = self.store.capacity();
        if capacity < required {
            self.abort();
            return Err(NvmError::CapacityExceeded { required, capacity });
        }
        self.reset_session();
        self.state = TransactionState::Preparing;
        debug!("Store prepared ({} of {} bytes needed)", required, capacity);
        Ok(())
    }

    /// Hand over the next block of the schema.
    ///
    /// During the first pass the block is validated and staged. During
    /// the second pass it must equal the staged bytes and is written.
    pub fn push(&mut self, slot: Slot, data: &[u8]) -> Result<(), NvmError> {
        let result = match self.state {
            TransactionState::Preparing => self.stage(slot, data),
            TransactionState::StoreInProgress => self.write_record(slot, data),
            state => Err(NvmError::InvalidState {
                operation: "push",
                state,
            }),
        };
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// End the first pass and erase the region.
    pub fn start_store(&mut self) -> Result<(), NvmError> {
        self.require(TransactionState::Preparing, "start_store")?;
        if let Err(e) = self.require_complete() {
            self.abort();
            return Err(e);
        }
        if let Err(e) = self.store.erase() {
            warn!("Erase before store failed: {}", e);
            self.abort();
            return Err(e);
        }
        self.cursor = 0;
        self.write_offset = NVM_HEADER_LEN;
        self.payload_crc = Crc32::new();
        self.state = TransactionState::StoreInProgress;
        debug!("Store started, region erased");
        Ok(())
    }

    /// Write the region header, making the stored records visible to loads.
    pub fn finish_store(&mut self) -> Result<(), NvmError> {
        self.require(TransactionState::StoreInProgress, "finish_store")?;
        let result = self.commit();
        match &result {
            Ok(()) => {
                self.staged.clear();
                self.state = TransactionState::Committed;
                info!(
                    "Configuration committed ({} blocks, {} bytes)",
                    SLOT_COUNT,
                    self.write_offset - NVM_HEADER_LEN
                );
            }
            Err(e) => {
                warn!("Commit failed: {}", e);
                self.abort();
            }
        }
        result
    }

    /// Open a load session after verifying the committed header and payload.
    pub fn start_load(&mut self) -> Result<(), NvmError> {
        self.require_closed("start_load")?;
        self.reset_session();
        match self.read_committed() {
            Ok(payload) => {
                self.payload = payload;
                self.state = TransactionState::LoadInProgress;
                debug!("Load started ({} payload bytes)", self.payload.len());
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Take the next block of the schema from the open load session.
    pub fn pop(&mut self, slot: Slot) -> Result<&[u8], NvmError> {
        if self.state != TransactionState::LoadInProgress {
            return Err(NvmError::InvalidState {
                operation: "pop",
                state: self.state,
            });
        }
        match self.next_record(slot) {
            Ok(range) => Ok(&self.payload[range]),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Close the load session. Every block must have been popped.
    pub fn finish_load(&mut self) -> Result<(), NvmError> {
        self.require(TransactionState::LoadInProgress, "finish_load")?;
        if let Err(e) = self.require_complete() {
            self.abort();
            return Err(e);
        }
        self.payload = Vec::new();
        self.state = TransactionState::Loaded;
        debug!("Load finished");
        Ok(())
    }

    /// Wipe the region. Rejected while a session is open.
    pub fn erase(&mut self) -> Result<(), NvmError> {
        self.require_closed("erase")?;
        self.store.erase()?;
        self.state = TransactionState::Idle;
        info!("Configuration region erased");
        Ok(())
    }

    /// Drop any open session.
    pub fn abort(&mut self) {
        if self.state.is_active() {
            debug!("Aborting {:?} session at block {}", self.state, self.cursor);
        }
        self.reset_session();
        self.state = TransactionState::Idle;
    }

    fn reset_session(&mut self) {
        self.cursor = 0;
        self.staged.clear();
        self.write_offset = NVM_HEADER_LEN;
        self.payload_crc = Crc32::new();
        self.payload = Vec::new();
        self.read_offset = 0;
    }

    fn require(&self, state: TransactionState, operation: &'static str) -> Result<(), NvmError> {
        if self.state == state {
            Ok(())
        } else {
            Err(NvmError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn require_closed(&self, operation: &'static str) -> Result<(), NvmError> {
        if self.state.is_active() {
            Err(NvmError::InvalidState {
                operation,
                state: self.state,
            })
        } else {
            Ok(())
        }
    }

    fn require_complete(&self) -> Result<(), NvmError> {
        if self.cursor == SLOT_COUNT {
            Ok(())
        } else {
            Err(NvmError::IncompleteSequence {
                done: self.cursor,
                total: SLOT_COUNT,
            })
        }
    }

    /// Slot the schema expects next, checked against the caller's.
    fn expect_slot(&self, slot: Slot) -> Result<Slot, NvmError> {
        let expected = *CONFIG_SCHEMA
            .get(self.cursor)
            .ok_or(NvmError::IncompleteSequence {
                done: self.cursor,
                total: SLOT_COUNT,
            })?;
        if expected != slot {
            return Err(NvmError::LayoutMismatch {
                expected,
                actual: slot,
            });
        }
        Ok(expected)
    }

    fn stage(&mut self, slot: Slot, data: &[u8]) -> Result<(), NvmError> {
        let slot = self.expect_slot(slot)?;
        let expected = slot.kind.block_len();
        if data.len() != expected {
            return Err(LayoutError::SizeMismatch {
                slot,
                expected,
                actual: data.len(),
            }
            .into());
        }
        self.staged.push(data.to_vec());
        self.cursor += 1;
        Ok(())
    }

    fn write_record(&mut self, slot: Slot, data: &[u8]) -> Result<(), NvmError> {
        let slot = self.expect_slot(slot)?;
        if self.staged.get(self.cursor).map(Vec::as_slice) != Some(data) {
            return Err(NvmError::StagingMismatch(slot));
        }
        let header = RecordHeader::for_block(slot, data).encode();
        self.store.write(self.write_offset, &header)?;
        self.store.write(self.write_offset + header.len(), data)?;
        self.payload_crc.update(&header);
        self.payload_crc.update(data);
        self.write_offset += header.len() + data.len();
        self.cursor += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NvmError> {
        self.require_complete()?;
        let header = RegionHeader {
            schema_version: SCHEMA_VERSION,
            slot_count: SLOT_COUNT as u16,
            payload_len: (self.write_offset - NVM_HEADER_LEN) as u32,
            payload_crc: self.payload_crc.finish(),
        };
        let encoded = header.encode();
        self.store.write(0, &encoded)?;

        let mut readback = [0u8; NVM_HEADER_LEN];
        self.store.read(0, &mut readback)?;
        if readback != encoded {
            return Err(NvmError::Corrupted("region header readback".to_string()));
        }
        Ok(())
    }

    fn read_committed(&self) -> Result<Vec<u8>, NvmError> {
        let mut raw = [0u8; NVM_HEADER_LEN];
        self.store.read(0, &mut raw)?;
        let header = RegionHeader::decode(&raw)?;

        if header.schema_version != SCHEMA_VERSION {
            return Err(NvmError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: header.schema_version,
            });
        }
        if header.slot_count as usize != SLOT_COUNT {
            return Err(NvmError::Corrupted(format!(
                "{} records stored, schema has {}",
                header.slot_count, SLOT_COUNT
            )));
        }
        let expected_len = SLOT_COUNT * NVM_RECORD_HEADER_LEN + schema_payload_len();
        let payload_len = header.payload_len as usize;
        if payload_len != expected_len
            || NVM_HEADER_LEN + payload_len > self.store.capacity()
        {
            return Err(NvmError::Corrupted(format!(
                "payload length {} bytes, schema needs {}",
                payload_len, expected_len
            )));
        }

        let mut payload = vec![0u8; payload_len];
        self.store.read(NVM_HEADER_LEN, &mut payload)?;
        let mut crc = Crc32::new();
        crc.update(&payload);
        if crc.finish() != header.payload_crc {
            return Err(NvmError::Corrupted("payload checksum".to_string()));
        }
        Ok(payload)
    }

    fn next_record(&mut self, slot: Slot) -> Result<Range<usize>, NvmError> {
        let slot = self.expect_slot(slot)?;
        let header_end = self.read_offset + NVM_RECORD_HEADER_LEN;
        let raw: &[u8; NVM_RECORD_HEADER_LEN] = self
            .payload
            .get(self.read_offset..header_end)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| NvmError::Corrupted(format!("record for {} truncated", slot)))?;
        let header = RecordHeader::decode(raw);

        if !header.matches(slot) {
            return Err(NvmError::Corrupted(format!(
                "record tag {:#04x}/{:#04x} where {} expected",
                header.tag, header.axis, slot
            )));
        }
        let expected = slot.kind.block_len();
        if header.len as usize != expected {
            return Err(LayoutError::SizeMismatch {
                slot,
                expected,
                actual: header.len as usize,
            }
            .into());
        }
        let range = header_end..header_end + expected;
        let data = self
            .payload
            .get(range.clone())
            .ok_or_else(|| NvmError::Corrupted(format!("record for {} truncated", slot)))?;
        if super::format::crc32(data) != header.crc {
            return Err(NvmError::Corrupted(format!("checksum of {}", slot)));
        }

        self.read_offset = range.end;
        self.cursor += 1;
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::simulation::RamStore;
    use axon_common::hw::HwVersion;
    use axon_common::layout::{ConfigSet, SlotKind};

    fn encoded_blocks(set: &ConfigSet) -> Vec<(Slot, Vec<u8>)> {
        CONFIG_SCHEMA
            .iter()
            .map(|&slot| (slot, set.encode_slot(slot).unwrap()))
            .collect()
    }

    fn run_store(mgr: &mut ConfigManager<RamStore>, blocks: &[(Slot, Vec<u8>)]) {
        mgr.prepare_store().unwrap();
        for (slot, data) in blocks {
            mgr.push(*slot, data).unwrap();
        }
        mgr.start_store().unwrap();
        for (slot, data) in blocks {
            mgr.push(*slot, data).unwrap();
        }
        mgr.finish_store().unwrap();
    }

    #[test]
    fn store_then_load_is_byte_identical() {
        let mut set = ConfigSet::defaults(HwVersion::V3_6);
        set.axes[0].motor.pole_pairs = 11;
        let blocks = encoded_blocks(&set);

        let mut mgr = ConfigManager::new(RamStore::new(4096));
        run_store(&mut mgr, &blocks);
        assert_eq!(mgr.state(), TransactionState::Committed);

        mgr.start_load().unwrap();
        for (slot, data) in &blocks {
            assert_eq!(mgr.pop(*slot).unwrap(), data.as_slice());
        }
        mgr.finish_load().unwrap();
        assert_eq!(mgr.state(), TransactionState::Loaded);
    }

    #[test]
    fn first_pass_never_writes() {
        let store = RamStore::new(4096);
        let mut mgr = ConfigManager::new(store.clone());
        let blocks = encoded_blocks(&ConfigSet::default());

        mgr.prepare_store().unwrap();
        mgr.push(blocks[0].0, &blocks[0].1).unwrap();
        mgr.push(blocks[1].0, &blocks[1].1).unwrap();
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.erase_count(), 0);
    }

    #[test]
    fn capacity_checked_before_anything() {
        let mut mgr = ConfigManager::new(RamStore::new(64));
        let err = mgr.prepare_store().unwrap_err();
        assert!(matches!(err, NvmError::CapacityExceeded { capacity: 64, .. }));
        assert_eq!(mgr.state(), TransactionState::Idle);
    }

    #[test]
    fn out_of_order_push_aborts() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        let blocks = encoded_blocks(&ConfigSet::default());

        mgr.prepare_store().unwrap();
        let err = mgr.push(blocks[1].0, &blocks[1].1).unwrap_err();
        assert_eq!(
            err,
            NvmError::LayoutMismatch {
                expected: Slot::global(SlotKind::Board),
                actual: Slot::global(SlotKind::Can),
            }
        );
        assert_eq!(mgr.state(), TransactionState::Idle);
    }

    #[test]
    fn wrong_block_size_aborts_before_write() {
        let store = RamStore::new(4096);
        let mut mgr = ConfigManager::new(store.clone());
        mgr.prepare_store().unwrap();
        let err = mgr.push(Slot::global(SlotKind::Board), &[0u8; 3]).unwrap_err();
        assert!(matches!(err, NvmError::Layout(LayoutError::SizeMismatch { .. })));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn start_store_requires_full_first_pass() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        let blocks = encoded_blocks(&ConfigSet::default());
        mgr.prepare_store().unwrap();
        mgr.push(blocks[0].0, &blocks[0].1).unwrap();
        assert_eq!(
            mgr.start_store(),
            Err(NvmError::IncompleteSequence {
                done: 1,
                total: SLOT_COUNT
            })
        );
    }

    #[test]
    fn second_pass_must_match_staging() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        let blocks = encoded_blocks(&ConfigSet::default());
        mgr.prepare_store().unwrap();
        for (slot, data) in &blocks {
            mgr.push(*slot, data).unwrap();
        }
        mgr.start_store().unwrap();

        let mut changed = blocks[0].1.clone();
        changed[0] ^= 1;
        let err = mgr.push(blocks[0].0, &changed).unwrap_err();
        assert_eq!(err, NvmError::StagingMismatch(blocks[0].0));

        // Nothing committed: the erased region has no header.
        assert_eq!(mgr.start_load(), Err(NvmError::NoValidConfig));
    }

    #[test]
    fn empty_region_has_no_config() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        assert_eq!(mgr.start_load(), Err(NvmError::NoValidConfig));
        assert_eq!(mgr.state(), TransactionState::Idle);
    }

    #[test]
    fn corrupted_record_fails_load() {
        let store = RamStore::new(4096);
        let mut mgr = ConfigManager::new(store.clone());
        run_store(&mut mgr, &encoded_blocks(&ConfigSet::default()));

        store.corrupt(NVM_HEADER_LEN + NVM_RECORD_HEADER_LEN + 1);
        assert!(matches!(mgr.start_load(), Err(NvmError::Corrupted(_))));
    }

    #[test]
    fn pop_out_of_order_aborts_load() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        run_store(&mut mgr, &encoded_blocks(&ConfigSet::default()));

        mgr.start_load().unwrap();
        let err = mgr.pop(Slot::global(SlotKind::Can)).unwrap_err();
        assert!(matches!(err, NvmError::LayoutMismatch { .. }));
        assert_eq!(mgr.state(), TransactionState::Idle);
    }

    #[test]
    fn finish_load_requires_every_block() {
        let blocks = encoded_blocks(&ConfigSet::default());
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        run_store(&mut mgr, &blocks);

        mgr.start_load().unwrap();
        mgr.pop(blocks[0].0).unwrap();
        assert!(matches!(
            mgr.finish_load(),
            Err(NvmError::IncompleteSequence { done: 1, .. })
        ));
    }

    #[test]
    fn erase_rejected_mid_session() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        mgr.prepare_store().unwrap();
        assert!(matches!(mgr.erase(), Err(NvmError::InvalidState { .. })));

        mgr.abort();
        mgr.erase().unwrap();
    }

    #[test]
    fn erase_removes_committed_config() {
        let mut mgr = ConfigManager::new(RamStore::new(4096));
        run_store(&mut mgr, &encoded_blocks(&ConfigSet::default()));
        mgr.erase().unwrap();
        assert_eq!(mgr.start_load(), Err(NvmError::NoValidConfig));
    }
}
