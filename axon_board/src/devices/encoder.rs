//! Position sensor interface.
//!
//! Only the absolute SPI encoder uses the shared bus. Its steady-state
//! reads are fire-and-forget: [`Encoder::issue_transfer`] enqueues a read
//! and the completion handler stores the angle. A failed or corrupted
//! frame is counted and dropped; the next control cycle simply reads
//! again.
//!
//! AMS read frame (16 bits, MSB first):
//!
//! ```text
//!   15     14     13..0
//! ┌──────┬──────┬─────────┐
//! │parity│ err  │  angle  │   even parity over all 16 bits
//! └──────┴──────┴─────────┘
//! ```

use super::{Device, DeviceError};
use crate::bus::{
    BusError, BusRequest, DeviceId, SharedBus, TransferCell, TransferListener, TransferStatus,
};
use axon_common::blocks::{EncoderBlock, EncoderMode, MotorBlock, MotorType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Read command for the angle register 0x3FFF, parity included.
pub const AMS_READ_ANGLE: u16 = 0xFFFF;

/// Counts per revolution of the 14-bit absolute encoder.
pub const AMS_CPR: u32 = 1 << 14;

/// Hall state transitions per electrical revolution.
const HALL_STATES: u32 = 6;

const AMS_ERROR_FLAG: u16 = 1 << 14;
const AMS_ANGLE_MASK: u16 = 0x3FFF;

/// Integrity failures of an AMS response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AmsFrameError {
    /// Odd number of set bits.
    #[error("parity error")]
    Parity,
    /// Sensor raised its error flag.
    #[error("error flag set")]
    ErrorFlag,
    /// Frame is not two bytes.
    #[error("short frame")]
    Short,
}

/// Extract the 14-bit angle from a response frame.
pub fn decode_ams_frame(rx: &[u8]) -> Result<u16, AmsFrameError> {
    let [hi, lo] = rx else {
        return Err(AmsFrameError::Short);
    };
    let word = u16::from_be_bytes([*hi, *lo]);
    if word.count_ones() % 2 != 0 {
        return Err(AmsFrameError::Parity);
    }
    if word & AMS_ERROR_FLAG != 0 {
        return Err(AmsFrameError::ErrorFlag);
    }
    Ok(word & AMS_ANGLE_MASK)
}

/// Steady-state read counters.
#[derive(Debug, Default)]
pub struct EncoderStats {
    reads: AtomicU32,
    errors: AtomicU32,
    skipped: AtomicU32,
}

impl EncoderStats {
    /// Frames accepted.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Frames rejected (bus error, parity or sensor error flag).
    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Reads not issued because the previous one was still pending.
    pub fn skipped(&self) -> u32 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Completion target of steady-state reads. Runs in bus IRQ context.
#[derive(Debug, Default)]
struct ReadState {
    pending: AtomicBool,
    angle: AtomicU16,
    valid: AtomicBool,
    stats: EncoderStats,
}

impl TransferListener for ReadState {
    fn on_transfer_complete(&self, status: TransferStatus, rx: &[u8]) {
        let decoded = match status {
            TransferStatus::Success => decode_ams_frame(rx).ok(),
            TransferStatus::Error => None,
        };
        match decoded {
            Some(angle) => {
                self.angle.store(angle, Ordering::Release);
                self.valid.store(true, Ordering::Release);
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.valid.store(false, Ordering::Release);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.pending.store(false, Ordering::Release);
    }
}

/// Position sensor of one axis.
pub struct Encoder {
    name: String,
    bus: Arc<dyn SharedBus>,
    device: DeviceId,
    config: Mutex<EncoderBlock>,
    mailbox: Arc<TransferCell>,
    reads: Arc<ReadState>,
}

impl Encoder {
    /// Create the encoder. `device` is the chip select used in SPI mode.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn SharedBus>,
        device: DeviceId,
        config: EncoderBlock,
    ) -> Self {
        Self {
            name: name.into(),
            bus,
            device,
            config: Mutex::new(config),
            mailbox: TransferCell::new(),
            reads: Arc::new(ReadState::default()),
        }
    }

    /// Check that `config` is usable with the given motor.
    pub fn check_config(config: &EncoderBlock, motor: &MotorBlock) -> Result<(), String> {
        if config.cpr == 0 {
            return Err("cpr must be positive".to_string());
        }
        if !(config.bandwidth > 0.0) {
            return Err(format!("bandwidth {} must be positive", config.bandwidth));
        }
        match config.mode {
            EncoderMode::SpiAbsoluteAms if config.cpr != AMS_CPR => Err(format!(
                "absolute SPI encoder has cpr {}, configured {}",
                AMS_CPR, config.cpr
            )),
            EncoderMode::Hall => match motor.pole_pairs.checked_mul(HALL_STATES) {
                Some(cpr) if cpr == config.cpr => Ok(()),
                Some(cpr) => Err(format!(
                    "hall encoder needs cpr {} for {} pole pairs",
                    cpr, motor.pole_pairs
                )),
                None => Err(format!(
                    "{} pole pairs out of range for a hall encoder",
                    motor.pole_pairs
                )),
            },
            EncoderMode::Incremental
                if config.use_index && motor.motor_type == MotorType::Acim =>
            {
                Err("index search is not supported with induction motors".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Install a new configuration block.
    pub fn apply_config(&self, config: EncoderBlock) {
        *self.config.lock() = config;
    }

    /// Active configuration.
    pub fn config(&self) -> EncoderBlock {
        self.config.lock().clone()
    }

    /// Whether this encoder is read over the shared bus.
    pub fn uses_bus(&self) -> bool {
        self.config.lock().mode == EncoderMode::SpiAbsoluteAms
    }

    /// Enqueue one non-blocking angle read.
    ///
    /// Returns `Ok(false)` when the previous read is still pending; reads
    /// are never stacked.
    pub fn issue_transfer(&self) -> Result<bool, DeviceError> {
        if !self.uses_bus() {
            return Ok(false);
        }
        if self.reads.pending.swap(true, Ordering::AcqRel) {
            self.reads.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let listener: Arc<dyn TransferListener> = self.reads.clone();
        let request = BusRequest::new(self.device, &AMS_READ_ANGLE.to_be_bytes(), listener)
            .and_then(|request| self.bus.acquire(request));
        if let Err(source) = request {
            self.reads.pending.store(false, Ordering::Release);
            return Err(DeviceError::Bus {
                device: self.name.clone(),
                source,
            });
        }
        Ok(true)
    }

    /// Latest valid angle [counts], if the last read succeeded.
    pub fn angle(&self) -> Option<u16> {
        self.reads
            .valid
            .load(Ordering::Acquire)
            .then(|| self.reads.angle.load(Ordering::Acquire))
    }

    /// Read counters.
    pub fn stats(&self) -> &EncoderStats {
        &self.reads.stats
    }

    fn read_blocking(&self, timeout: Duration) -> Result<u16, DeviceError> {
        let rx = self
            .mailbox
            .transfer_blocking(
                self.bus.as_ref(),
                self.device,
                &AMS_READ_ANGLE.to_be_bytes(),
                timeout,
            )
            .map_err(|source: BusError| DeviceError::Bus {
                device: self.name.clone(),
                source,
            })?;
        decode_ams_frame(&rx).map_err(|reason| DeviceError::InvalidFrame {
            device: self.name.clone(),
            reason,
        })
    }
}

impl Device for Encoder {
    fn name(&self) -> &str {
        &self.name
    }

    /// SPI encoders must answer one clean angle frame. Other modes have
    /// no bus traffic.
    fn setup(&self, timeout: Duration) -> Result<(), DeviceError> {
        if !self.uses_bus() {
            debug!("{}: no bus setup needed", self.name);
            return Ok(());
        }
        let angle = self.read_blocking(timeout)?;
        self.reads.angle.store(angle, Ordering::Release);
        self.reads.valid.store(true, Ordering::Release);
        info!("{} responding, angle {}", self.name, angle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(word: u16) -> [u8; 2] {
        word.to_be_bytes()
    }

    fn with_parity(word: u16) -> u16 {
        if word.count_ones() % 2 == 0 { word } else { word | 0x8000 }
    }

    #[test]
    fn read_command_has_even_parity() {
        assert_eq!(AMS_READ_ANGLE.count_ones() % 2, 0);
    }

    #[test]
    fn valid_frame_decodes_angle() {
        let word = with_parity(0x1234);
        assert_eq!(decode_ams_frame(&frame(word)), Ok(0x1234));
    }

    #[test]
    fn parity_and_error_flag_rejected() {
        let good = with_parity(0x0123);
        assert_eq!(
            decode_ams_frame(&frame(good ^ 0x0001)),
            Err(AmsFrameError::Parity)
        );
        let flagged = with_parity(0x0123 | AMS_ERROR_FLAG);
        assert_eq!(decode_ams_frame(&frame(flagged)), Err(AmsFrameError::ErrorFlag));
        assert_eq!(decode_ams_frame(&[0x12]), Err(AmsFrameError::Short));
    }

    #[test]
    fn config_rules() {
        let motor = MotorBlock::default();
        let mut enc = EncoderBlock::default();
        assert!(Encoder::check_config(&enc, &motor).is_ok());

        enc.mode = EncoderMode::SpiAbsoluteAms;
        assert!(Encoder::check_config(&enc, &motor).is_err());
        enc.cpr = AMS_CPR;
        assert!(Encoder::check_config(&enc, &motor).is_ok());

        enc.mode = EncoderMode::Hall;
        enc.cpr = 6 * motor.pole_pairs;
        assert!(Encoder::check_config(&enc, &motor).is_ok());

        enc.cpr = 0;
        assert!(Encoder::check_config(&enc, &motor).is_err());
    }

    #[test]
    fn hall_cpr_check_rejects_huge_pole_pairs() {
        let motor = MotorBlock {
            pole_pairs: 0x3000_0000,
            ..MotorBlock::default()
        };
        let enc = EncoderBlock {
            mode: EncoderMode::Hall,
            ..EncoderBlock::default()
        };
        let err = Encoder::check_config(&enc, &motor).unwrap_err();
        assert!(err.contains("out of range"), "{err}");
    }

    #[test]
    fn completion_handler_counts_errors() {
        let state = ReadState::default();
        state.pending.store(true, Ordering::SeqCst);
        state.on_transfer_complete(TransferStatus::Error, &[]);
        assert_eq!(state.stats.errors(), 1);
        assert!(!state.pending.load(Ordering::SeqCst));

        state.on_transfer_complete(TransferStatus::Success, &frame(with_parity(42)));
        assert_eq!(state.stats.reads(), 1);
        assert_eq!(state.angle.load(Ordering::SeqCst), 42);
    }
}
