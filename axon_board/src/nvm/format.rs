//! On-media layout of the configuration region.
//!
//! All integers are little-endian.
//!
//! Region header (20 bytes, at offset 0):
//!
//! | bytes  | field          |
//! |--------|----------------|
//! | 0..4   | magic `AXCF`   |
//! | 4..6   | schema version |
//! | 6..8   | slot count     |
//! | 8..12  | payload length |
//! | 12..16 | payload CRC-32 |
//! | 16..20 | header CRC-32  |
//!
//! Record header (8 bytes, before each block): tag, axis byte, block
//! length (u16), block CRC-32.

use super::NvmError;
use super::store::ERASED_BYTE;
use axon_common::layout::{NVM_HEADER_LEN, NVM_RECORD_HEADER_LEN, Slot};
use static_assertions::const_assert_eq;

/// Marker identifying a committed configuration region.
pub const REGION_MAGIC: [u8; 4] = *b"AXCF";

const_assert_eq!(NVM_HEADER_LEN, 20);
const_assert_eq!(NVM_RECORD_HEADER_LEN, 8);

const CRC32_POLY: u32 = 0xEDB8_8320;

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Incremental CRC-32 (IEEE 802.3).
#[derive(Debug, Clone, Copy)]
pub struct Crc32(u32);

impl Default for Crc32 {
    fn default() -> Self {
        Self(!0)
    }
}

impl Crc32 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 = CRC32_TABLE[((self.0 ^ byte as u32) & 0xFF) as usize] ^ (self.0 >> 8);
        }
    }

    /// Final checksum value.
    pub fn finish(&self) -> u32 {
        !self.0
    }
}

/// CRC-32 of one buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

/// Commit marker at the start of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    /// Schema version the records were written with.
    pub schema_version: u16,
    /// Number of records.
    pub slot_count: u16,
    /// Bytes of records following the header.
    pub payload_len: u32,
    /// CRC-32 over all record bytes.
    pub payload_crc: u32,
}

impl RegionHeader {
    /// Serialize, including the trailing header checksum.
    pub fn encode(&self) -> [u8; NVM_HEADER_LEN] {
        let mut out = [0u8; NVM_HEADER_LEN];
        out[0..4].copy_from_slice(&REGION_MAGIC);
        out[4..6].copy_from_slice(&self.schema_version.to_le_bytes());
        out[6..8].copy_from_slice(&self.slot_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_crc.to_le_bytes());
        let header_crc = crc32(&out[..16]);
        out[16..20].copy_from_slice(&header_crc.to_le_bytes());
        out
    }

    /// Parse and verify a stored header.
    ///
    /// An erased header means nothing was ever committed, or a store was
    /// interrupted before `finish_store`.
    pub fn decode(bytes: &[u8; NVM_HEADER_LEN]) -> Result<Self, NvmError> {
        if bytes.iter().all(|&b| b == ERASED_BYTE) {
            return Err(NvmError::NoValidConfig);
        }
        if bytes[0..4] != REGION_MAGIC {
            return Err(NvmError::Corrupted("bad region magic".to_string()));
        }
        let stored_crc = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if crc32(&bytes[..16]) != stored_crc {
            return Err(NvmError::Corrupted("region header checksum".to_string()));
        }
        Ok(Self {
            schema_version: u16::from_le_bytes([bytes[4], bytes[5]]),
            slot_count: u16::from_le_bytes([bytes[6], bytes[7]]),
            payload_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload_crc: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

/// Per-block header preceding each record's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Slot kind tag.
    pub tag: u8,
    /// Axis byte (`Slot::NO_AXIS` for board-wide blocks).
    pub axis: u8,
    /// Block length.
    pub len: u16,
    /// CRC-32 of the block data.
    pub crc: u32,
}

impl RecordHeader {
    /// Header for `data` stored in `slot`.
    pub fn for_block(slot: Slot, data: &[u8]) -> Self {
        Self {
            tag: slot.kind.tag(),
            axis: slot.axis_byte(),
            len: data.len() as u16,
            crc: crc32(data),
        }
    }

    /// Whether the header names `slot`.
    pub fn matches(&self, slot: Slot) -> bool {
        self.tag == slot.kind.tag() && self.axis == slot.axis_byte()
    }

    /// Serialize.
    pub fn encode(&self) -> [u8; NVM_RECORD_HEADER_LEN] {
        let mut out = [0u8; NVM_RECORD_HEADER_LEN];
        out[0] = self.tag;
        out[1] = self.axis;
        out[2..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..8].copy_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Parse.
    pub fn decode(bytes: &[u8; NVM_RECORD_HEADER_LEN]) -> Self {
        Self {
            tag: bytes[0],
            axis: bytes[1],
            len: u16::from_le_bytes([bytes[2], bytes[3]]),
            crc: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_common::layout::SlotKind;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn crc32_incremental_matches_one_shot() {
        let mut crc = Crc32::new();
        crc.update(b"1234");
        crc.update(b"56789");
        assert_eq!(crc.finish(), crc32(b"123456789"));
    }

    #[test]
    fn region_header_decodes() {
        let header = RegionHeader {
            schema_version: 1,
            slot_count: 18,
            payload_len: 512,
            payload_crc: 0xDEAD_BEEF,
        };
        assert_eq!(RegionHeader::decode(&header.encode()), Ok(header));
    }

    #[test]
    fn erased_header_means_no_config() {
        let erased = [ERASED_BYTE; NVM_HEADER_LEN];
        assert_eq!(RegionHeader::decode(&erased), Err(NvmError::NoValidConfig));
    }

    #[test]
    fn flipped_bit_in_header_detected() {
        let header = RegionHeader {
            schema_version: 1,
            slot_count: 18,
            payload_len: 512,
            payload_crc: 7,
        };
        let mut bytes = header.encode();
        bytes[9] ^= 0x01;
        assert!(matches!(
            RegionHeader::decode(&bytes),
            Err(NvmError::Corrupted(_))
        ));
    }

    #[test]
    fn record_header_matches_slot() {
        let slot = Slot::for_axis(SlotKind::Motor, 1);
        let header = RecordHeader::for_block(slot, &[1, 2, 3]);
        assert!(header.matches(slot));
        assert!(!header.matches(Slot::for_axis(SlotKind::Motor, 0)));
        assert_eq!(RecordHeader::decode(&header.encode()), header);
    }
}
