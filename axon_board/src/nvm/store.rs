//! Raw non-volatile byte storage.

use super::NvmError;

/// Value of an erased byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Byte-range erase/read/write primitive of the configuration region.
///
/// Follows flash semantics: `erase` sets the whole region to
/// [`ERASED_BYTE`], and `write` may only target erased bytes. No wear
/// leveling happens at this layer.
pub trait ConfigStore: Send {
    /// Region size in bytes.
    fn capacity(&self) -> usize;

    /// Wipe the whole region.
    fn erase(&mut self) -> Result<(), NvmError>;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError>;

    /// Program `data` at `offset`. Target bytes must be erased.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmError>;
}

/// Check that `offset..offset + len` lies inside a region of `capacity`.
pub fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<(), NvmError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(NvmError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

/// Check that every byte of `region` is erased. `base` is its offset.
pub fn check_erased(region: &[u8], base: usize) -> Result<(), NvmError> {
    match region.iter().position(|&b| b != ERASED_BYTE) {
        Some(i) => Err(NvmError::NotErased { offset: base + i }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_accept_exact_fit() {
        assert!(check_bounds(96, 32, 128).is_ok());
        assert!(check_bounds(97, 32, 128).is_err());
        assert!(check_bounds(usize::MAX, 2, 128).is_err());
    }

    #[test]
    fn erased_check_reports_first_programmed_byte() {
        assert!(check_erased(&[0xFF; 4], 0).is_ok());
        assert_eq!(
            check_erased(&[0xFF, 0x00, 0x12], 10),
            Err(NvmError::NotErased { offset: 11 })
        );
    }
}
