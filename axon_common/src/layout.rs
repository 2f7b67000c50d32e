//! The versioned configuration block schema.
//!
//! [`CONFIG_SCHEMA`] is the ordered list of typed slots that both store
//! and load walk. The order and the encoded length of every block are a
//! storage contract: any change to either must bump [`SCHEMA_VERSION`],
//! otherwise previously stored data would be decoded into the wrong
//! blocks.
//!
//! ```text
//! slot  0        1      2..=9 (axis 0)                  10..=17 (axis 1)
//!      ┌───────┬─────┬─────────────────────────────────┬────────────────┐
//!      │ Board │ Can │ Enc Sless Ctrl Traj Min Max Mot Ax │      ...       │
//!      └───────┴─────┴─────────────────────────────────┴────────────────┘
//! ```

use crate::blocks::{
    AxisBlock, BoardBlock, CanBlock, ControllerBlock, EncoderBlock, EndstopBlock, MotorBlock,
    SensorlessBlock, TrapTrajBlock,
};
use crate::consts::AXIS_COUNT;
use crate::hw::{axis_hw_configs, AxisHwConfig, HwVersion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Version of the slot list and block layouts. Bump on any change.
pub const SCHEMA_VERSION: u16 = 1;

/// Number of per-axis slots.
pub const SLOTS_PER_AXIS: usize = 8;

/// Total number of slots in the schema.
pub const SLOT_COUNT: usize = 2 + SLOTS_PER_AXIS * AXIS_COUNT;

const_assert!(SLOT_COUNT <= u16::MAX as usize);
const_assert!(AXIS_COUNT < 0xFF);

/// Errors raised while encoding or decoding a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// In-memory serialization failed.
    #[error("Failed to encode {slot}: {reason}")]
    Encode {
        /// Slot being encoded.
        slot: Slot,
        /// Codec message.
        reason: String,
    },

    /// Stored bytes are not a valid block.
    #[error("Failed to decode {slot}: {reason}")]
    Decode {
        /// Slot being decoded.
        slot: Slot,
        /// Codec message.
        reason: String,
    },

    /// Stored length differs from the block's fixed length.
    #[error("Block size mismatch for {slot}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Slot being decoded.
        slot: Slot,
        /// Fixed length of the block type.
        expected: usize,
        /// Stored length.
        actual: usize,
    },

    /// Slot refers to an axis the board does not have.
    #[error("Slot {0} is not part of this build's schema")]
    UnknownSlot(Slot),
}

/// Type of block held by a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    /// Board-wide block.
    Board,
    /// CAN interface block.
    Can,
    /// Encoder block.
    Encoder,
    /// Sensorless estimator block.
    Sensorless,
    /// Controller block.
    Controller,
    /// Trapezoidal trajectory block.
    TrapTraj,
    /// Minimum endstop block.
    MinEndstop,
    /// Maximum endstop block.
    MaxEndstop,
    /// Motor block.
    Motor,
    /// Axis block.
    Axis,
}

impl SlotKind {
    /// Per-axis slots in storage order.
    pub const PER_AXIS: [SlotKind; SLOTS_PER_AXIS] = [
        SlotKind::Encoder,
        SlotKind::Sensorless,
        SlotKind::Controller,
        SlotKind::TrapTraj,
        SlotKind::MinEndstop,
        SlotKind::MaxEndstop,
        SlotKind::Motor,
        SlotKind::Axis,
    ];

    /// Tag byte written in each record header.
    pub const fn tag(self) -> u8 {
        match self {
            SlotKind::Board => 0x01,
            SlotKind::Can => 0x02,
            SlotKind::Encoder => 0x10,
            SlotKind::Sensorless => 0x11,
            SlotKind::Controller => 0x12,
            SlotKind::TrapTraj => 0x13,
            SlotKind::MinEndstop => 0x14,
            SlotKind::MaxEndstop => 0x15,
            SlotKind::Motor => 0x16,
            SlotKind::Axis => 0x17,
        }
    }

    /// Encoded length of this block type in bytes.
    pub fn block_len(self) -> usize {
        match self {
            SlotKind::Board => encoded_len(&BoardBlock::default()),
            SlotKind::Can => encoded_len(&CanBlock::default()),
            SlotKind::Encoder => encoded_len(&EncoderBlock::default()),
            SlotKind::Sensorless => encoded_len(&SensorlessBlock::default()),
            SlotKind::Controller => encoded_len(&ControllerBlock::default()),
            SlotKind::TrapTraj => encoded_len(&TrapTrajBlock::default()),
            SlotKind::MinEndstop | SlotKind::MaxEndstop => encoded_len(&EndstopBlock::default()),
            SlotKind::Motor => encoded_len(&MotorBlock::default()),
            SlotKind::Axis => encoded_len(&AxisBlock::default()),
        }
    }
}

/// One typed position in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    /// Block type.
    pub kind: SlotKind,
    /// Owning axis, `None` for board-wide blocks.
    pub axis: Option<u8>,
}

impl Slot {
    /// Axis byte used in record headers (`0xFF` for board-wide blocks).
    pub const NO_AXIS: u8 = 0xFF;

    /// Board-wide slot.
    pub const fn global(kind: SlotKind) -> Self {
        Self { kind, axis: None }
    }

    /// Per-axis slot.
    pub const fn for_axis(kind: SlotKind, axis: u8) -> Self {
        Self {
            kind,
            axis: Some(axis),
        }
    }

    /// Axis byte for the record header.
    pub const fn axis_byte(&self) -> u8 {
        match self.axis {
            Some(axis) => axis,
            None => Self::NO_AXIS,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.axis {
            Some(axis) => write!(f, "axis{}.{:?}", axis, self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

/// The ordered slot list shared by store and load.
pub const CONFIG_SCHEMA: [Slot; SLOT_COUNT] = build_schema();

const fn build_schema() -> [Slot; SLOT_COUNT] {
    let mut out = [Slot::global(SlotKind::Board); SLOT_COUNT];
    out[1] = Slot::global(SlotKind::Can);
    let mut axis = 0;
    while axis < AXIS_COUNT {
        let mut k = 0;
        while k < SLOTS_PER_AXIS {
            out[2 + axis * SLOTS_PER_AXIS + k] = Slot::for_axis(SlotKind::PER_AXIS[k], axis as u8);
            k += 1;
        }
        axis += 1;
    }
    out
}

/// Sum of the encoded lengths of every slot in the schema.
pub fn schema_payload_len() -> usize {
    CONFIG_SCHEMA.iter().map(|slot| slot.kind.block_len()).sum()
}

/// Size of the committed region header [bytes].
pub const NVM_HEADER_LEN: usize = 20;

/// Size of each record header [bytes].
pub const NVM_RECORD_HEADER_LEN: usize = 8;

/// Smallest NVM region able to hold the full block schema.
pub fn min_nvm_capacity() -> usize {
    NVM_HEADER_LEN + SLOT_COUNT * NVM_RECORD_HEADER_LEN + schema_payload_len()
}

fn encoded_len<B: Serialize>(block: &B) -> usize {
    // Blocks contain only fixed-size fields, so sizing cannot fail.
    bincode::serialized_size(block).map_or(0, |len| len as usize)
}

/// All blocks of one axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisConfigSet {
    /// Encoder block.
    pub encoder: EncoderBlock,
    /// Sensorless estimator block.
    pub sensorless: SensorlessBlock,
    /// Controller block.
    pub controller: ControllerBlock,
    /// Trajectory planner block.
    pub trap_traj: TrapTrajBlock,
    /// Minimum endstop block.
    pub min_endstop: EndstopBlock,
    /// Maximum endstop block.
    pub max_endstop: EndstopBlock,
    /// Motor block.
    pub motor: MotorBlock,
    /// Axis block.
    pub axis: AxisBlock,
}

impl AxisConfigSet {
    /// Built-in defaults plus the defaults that depend on axis index and wiring.
    pub fn defaults(axis_index: usize, hw: &AxisHwConfig) -> Self {
        let mut set = Self::default();
        set.axis.load_default_step_dir_pins(hw);
        set.axis.load_default_can_id(axis_index);
        set.controller.load_encoder_axis = axis_index as u8;
        set
    }
}

/// Every configuration block of the board, in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSet {
    /// Board-wide block.
    pub board: BoardBlock,
    /// CAN block.
    pub can: CanBlock,
    /// Per-axis blocks.
    pub axes: [AxisConfigSet; AXIS_COUNT],
}

impl ConfigSet {
    /// Reset every block to its default and re-derive board dependent defaults.
    pub fn defaults(hw: HwVersion) -> Self {
        let wiring = axis_hw_configs(hw);
        Self {
            board: BoardBlock::default(),
            can: CanBlock::default(),
            axes: std::array::from_fn(|i| AxisConfigSet::defaults(i, &wiring[i])),
        }
    }

    fn axis_set(&self, slot: Slot) -> Result<&AxisConfigSet, LayoutError> {
        slot.axis
            .and_then(|axis| self.axes.get(axis as usize))
            .ok_or(LayoutError::UnknownSlot(slot))
    }

    fn axis_set_mut(&mut self, slot: Slot) -> Result<&mut AxisConfigSet, LayoutError> {
        slot.axis
            .and_then(|axis| self.axes.get_mut(axis as usize))
            .ok_or(LayoutError::UnknownSlot(slot))
    }

    /// Serialize the block held by `slot`.
    pub fn encode_slot(&self, slot: Slot) -> Result<Vec<u8>, LayoutError> {
        match slot.kind {
            SlotKind::Board => encode(slot, &self.board),
            SlotKind::Can => encode(slot, &self.can),
            SlotKind::Encoder => encode(slot, &self.axis_set(slot)?.encoder),
            SlotKind::Sensorless => encode(slot, &self.axis_set(slot)?.sensorless),
            SlotKind::Controller => encode(slot, &self.axis_set(slot)?.controller),
            SlotKind::TrapTraj => encode(slot, &self.axis_set(slot)?.trap_traj),
            SlotKind::MinEndstop => encode(slot, &self.axis_set(slot)?.min_endstop),
            SlotKind::MaxEndstop => encode(slot, &self.axis_set(slot)?.max_endstop),
            SlotKind::Motor => encode(slot, &self.axis_set(slot)?.motor),
            SlotKind::Axis => encode(slot, &self.axis_set(slot)?.axis),
        }
    }

    /// Replace the block held by `slot` with the decoded `bytes`.
    ///
    /// The block is only replaced if decoding succeeds and consumes exactly
    /// the block's fixed length.
    pub fn decode_slot(&mut self, slot: Slot, bytes: &[u8]) -> Result<(), LayoutError> {
        match slot.kind {
            SlotKind::Board => decode_into(slot, &mut self.board, bytes),
            SlotKind::Can => decode_into(slot, &mut self.can, bytes),
            SlotKind::Encoder => decode_into(slot, &mut self.axis_set_mut(slot)?.encoder, bytes),
            SlotKind::Sensorless => {
                decode_into(slot, &mut self.axis_set_mut(slot)?.sensorless, bytes)
            }
            SlotKind::Controller => {
                decode_into(slot, &mut self.axis_set_mut(slot)?.controller, bytes)
            }
            SlotKind::TrapTraj => decode_into(slot, &mut self.axis_set_mut(slot)?.trap_traj, bytes),
            SlotKind::MinEndstop => {
                decode_into(slot, &mut self.axis_set_mut(slot)?.min_endstop, bytes)
            }
            SlotKind::MaxEndstop => {
                decode_into(slot, &mut self.axis_set_mut(slot)?.max_endstop, bytes)
            }
            SlotKind::Motor => decode_into(slot, &mut self.axis_set_mut(slot)?.motor, bytes),
            SlotKind::Axis => decode_into(slot, &mut self.axis_set_mut(slot)?.axis, bytes),
        }
    }
}

impl Default for ConfigSet {
    fn default() -> Self {
        Self::defaults(HwVersion::default())
    }
}

fn encode<B: Serialize>(slot: Slot, block: &B) -> Result<Vec<u8>, LayoutError> {
    bincode::serialize(block).map_err(|e| LayoutError::Encode {
        slot,
        reason: e.to_string(),
    })
}

fn decode_into<B>(slot: Slot, target: &mut B, bytes: &[u8]) -> Result<(), LayoutError>
where
    B: Serialize + DeserializeOwned,
{
    let block: B = bincode::deserialize(bytes).map_err(|e| LayoutError::Decode {
        slot,
        reason: e.to_string(),
    })?;
    let expected = encoded_len(&block);
    if expected != bytes.len() {
        return Err(LayoutError::SizeMismatch {
            slot,
            expected,
            actual: bytes.len(),
        });
    }
    *target = block;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::MotorType;

    #[test]
    fn schema_order_is_board_can_then_axes() {
        assert_eq!(CONFIG_SCHEMA[0], Slot::global(SlotKind::Board));
        assert_eq!(CONFIG_SCHEMA[1], Slot::global(SlotKind::Can));
        assert_eq!(CONFIG_SCHEMA[2], Slot::for_axis(SlotKind::Encoder, 0));
        assert_eq!(CONFIG_SCHEMA[9], Slot::for_axis(SlotKind::Axis, 0));
        assert_eq!(CONFIG_SCHEMA[10], Slot::for_axis(SlotKind::Encoder, 1));
        assert_eq!(CONFIG_SCHEMA[SLOT_COUNT - 1], Slot::for_axis(SlotKind::Axis, 1));
    }

    #[test]
    fn tags_are_unique() {
        let mut tags: Vec<u8> = SlotKind::PER_AXIS.iter().map(|k| k.tag()).collect();
        tags.push(SlotKind::Board.tag());
        tags.push(SlotKind::Can.tag());
        let before = tags.len();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), before);
    }

    #[test]
    fn every_slot_roundtrips_byte_identical() {
        let mut source = ConfigSet::defaults(HwVersion::V3_6);
        source.axes[1].motor.motor_type = MotorType::Gimbal;
        source.axes[0].encoder.offset = -1234;
        source.board.uart_baudrate = 921_600;

        let mut target = ConfigSet::defaults(HwVersion::V3_3);
        for slot in CONFIG_SCHEMA {
            let bytes = source.encode_slot(slot).unwrap();
            assert_eq!(bytes.len(), slot.kind.block_len(), "{slot}");
            target.decode_slot(slot, &bytes).unwrap();
            assert_eq!(target.encode_slot(slot).unwrap(), bytes);
        }
        assert_eq!(target, source);
    }

    #[test]
    fn truncated_block_rejected_and_target_untouched() {
        let source = ConfigSet::default();
        let slot = Slot::for_axis(SlotKind::Motor, 0);
        let bytes = source.encode_slot(slot).unwrap();

        let mut target = ConfigSet::default();
        target.axes[0].motor.pole_pairs = 99;
        let err = target.decode_slot(slot, &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, LayoutError::Decode { .. }));
        assert_eq!(target.axes[0].motor.pole_pairs, 99);
    }

    #[test]
    fn oversized_block_rejected() {
        let source = ConfigSet::default();
        let slot = Slot::global(SlotKind::Can);
        let mut bytes = source.encode_slot(slot).unwrap();
        bytes.push(0);

        let mut target = ConfigSet::default();
        let err = target.decode_slot(slot, &bytes).unwrap_err();
        assert!(matches!(err, LayoutError::SizeMismatch { .. }));
    }

    #[test]
    fn slot_for_missing_axis_rejected() {
        let set = ConfigSet::default();
        let slot = Slot::for_axis(SlotKind::Motor, AXIS_COUNT as u8);
        assert_eq!(set.encode_slot(slot), Err(LayoutError::UnknownSlot(slot)));
    }

    #[test]
    fn defaults_are_distinct_per_axis() {
        let set = ConfigSet::defaults(HwVersion::V3_5);
        assert_ne!(set.axes[0].axis.can_node_id, set.axes[1].axis.can_node_id);
        assert_ne!(set.axes[0].axis.step_gpio_pin, set.axes[1].axis.step_gpio_pin);
        assert_eq!(set.axes[1].controller.load_encoder_axis, 1);
    }

    #[test]
    fn payload_len_covers_all_slots() {
        let manual: usize = CONFIG_SCHEMA
            .iter()
            .map(|slot| ConfigSet::default().encode_slot(*slot).unwrap().len())
            .sum();
        assert_eq!(schema_payload_len(), manual);
    }
}
