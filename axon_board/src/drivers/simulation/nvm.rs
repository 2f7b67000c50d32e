//! Simulated configuration flash.
//!
//! [`RamStore`] keeps the region in memory and is shared between clones,
//! so a test can drop a manager, "power cycle", and open a new manager on
//! the same bytes. [`FileStore`] backs the region with a file for the
//! host binary.

use crate::nvm::store::{check_bounds, check_erased, ConfigStore, ERASED_BYTE};
use crate::nvm::NvmError;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct RamState {
    bytes: Vec<u8>,
    writes: usize,
    erases: usize,
    /// Writes left before simulated power loss.
    writes_until_loss: Option<usize>,
    powered: bool,
}

/// In-memory flash region with power-loss injection.
#[derive(Debug, Clone)]
pub struct RamStore {
    state: Arc<Mutex<RamState>>,
}

impl RamStore {
    /// Erased region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RamState {
                bytes: vec![ERASED_BYTE; capacity],
                writes: 0,
                erases: 0,
                writes_until_loss: None,
                powered: true,
            })),
        }
    }

    /// Lose power after `writes` more successful writes.
    ///
    /// Every later write or erase fails until [`restore_power`](Self::restore_power).
    pub fn power_loss_after(&self, writes: usize) {
        let mut state = self.state.lock();
        state.writes_until_loss = Some(writes);
    }

    /// Power the region again. Stored bytes are kept.
    pub fn restore_power(&self) {
        let mut state = self.state.lock();
        state.writes_until_loss = None;
        state.powered = true;
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Number of successful erases.
    pub fn erase_count(&self) -> usize {
        self.state.lock().erases
    }

    /// Flip every bit of the byte at `offset`.
    pub fn corrupt(&self, offset: usize) {
        let mut state = self.state.lock();
        if let Some(byte) = state.bytes.get_mut(offset) {
            *byte = !*byte;
        }
    }

    /// Copy of the whole region.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }
}

impl ConfigStore for RamStore {
    fn capacity(&self) -> usize {
        self.state.lock().bytes.len()
    }

    fn erase(&mut self) -> Result<(), NvmError> {
        let mut state = self.state.lock();
        if !state.powered {
            return Err(NvmError::Io("power lost".to_string()));
        }
        state.bytes.fill(ERASED_BYTE);
        state.erases += 1;
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError> {
        let state = self.state.lock();
        check_bounds(offset, buf.len(), state.bytes.len())?;
        buf.copy_from_slice(&state.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmError> {
        let mut state = self.state.lock();
        if state.writes_until_loss == Some(0) {
            state.powered = false;
        }
        if !state.powered {
            return Err(NvmError::Io("power lost".to_string()));
        }
        check_bounds(offset, data.len(), state.bytes.len())?;
        let target = &mut state.bytes[offset..offset + data.len()];
        check_erased(target, offset)?;
        target.copy_from_slice(data);
        state.writes += 1;
        if let Some(left) = state.writes_until_loss.as_mut() {
            *left -= 1;
        }
        Ok(())
    }
}

/// Flash region persisted to a file.
///
/// The file is read once on open; every write is written through and
/// synced.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    image: Vec<u8>,
    file: File,
}

impl FileStore {
    /// Open the backing file, creating an erased region if it is missing.
    ///
    /// An existing file of a different size is left untouched and
    /// rejected with [`NvmError::CapacityMismatch`].
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, NvmError> {
        let path = path.as_ref().to_path_buf();
        let image = match fs::read(&path) {
            Ok(bytes) if bytes.len() == capacity => {
                debug!("Opened NVM file {:?} ({} bytes)", path, capacity);
                bytes
            }
            Ok(bytes) => {
                warn!(
                    "NVM file {:?} holds {} bytes, expected {}",
                    path,
                    bytes.len(),
                    capacity
                );
                return Err(NvmError::CapacityMismatch {
                    expected: capacity,
                    found: bytes.len(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating NVM file {:?}", path);
                vec![ERASED_BYTE; capacity]
            }
            Err(e) => return Err(NvmError::Io(e.to_string())),
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| NvmError::Io(e.to_string()))?;
        file.set_len(capacity as u64)
            .map_err(|e| NvmError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&image))
            .and_then(|_| file.sync_data())
            .map_err(|e| NvmError::Io(e.to_string()))?;

        Ok(Self { path, image, file })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_range(&mut self, offset: usize, len: usize) -> Result<(), NvmError> {
        let bytes = &self.image[offset..offset + len];
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| self.file.write_all(bytes))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| NvmError::Io(e.to_string()))
    }
}

impl ConfigStore for FileStore {
    fn capacity(&self) -> usize {
        self.image.len()
    }

    fn erase(&mut self) -> Result<(), NvmError> {
        self.image.fill(ERASED_BYTE);
        self.flush_range(0, self.image.len())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError> {
        check_bounds(offset, buf.len(), self.image.len())?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), NvmError> {
        check_bounds(offset, data.len(), self.image.len())?;
        let target = &mut self.image[offset..offset + data.len()];
        check_erased(target, offset)?;
        target.copy_from_slice(data);
        self.flush_range(offset, data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ram_store_enforces_erase_before_write() {
        let mut store = RamStore::new(16);
        store.write(0, &[1, 2]).unwrap();
        assert_eq!(
            store.write(1, &[3]),
            Err(NvmError::NotErased { offset: 1 })
        );
        store.erase().unwrap();
        store.write(1, &[3]).unwrap();
    }

    #[test]
    fn ram_store_power_loss_is_sticky() {
        let mut store = RamStore::new(16);
        store.power_loss_after(1);
        store.write(0, &[1]).unwrap();
        assert!(store.write(1, &[2]).is_err());
        assert!(store.erase().is_err());

        store.restore_power();
        store.write(1, &[2]).unwrap();
        assert_eq!(&store.snapshot()[..2], &[1, 2]);
    }

    #[test]
    fn clones_share_bytes() {
        let mut a = RamStore::new(8);
        let b = a.clone();
        a.write(3, &[0x42]).unwrap();
        let mut buf = [0u8; 1];
        b.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0x42]);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nvm.bin");

        let mut store = FileStore::open(&path, 64).unwrap();
        store.write(10, &[9, 8, 7]).unwrap();
        drop(store);

        let store = FileStore::open(&path, 64).unwrap();
        let mut buf = [0u8; 3];
        store.read(10, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);
    }

    #[test]
    fn file_store_size_mismatch_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nvm.bin");
        fs::write(&path, [0x5Au8; 10]).unwrap();

        let err = FileStore::open(&path, 32).unwrap_err();
        assert_eq!(
            err,
            NvmError::CapacityMismatch {
                expected: 32,
                found: 10
            }
        );
        assert_eq!(fs::read(&path).unwrap(), vec![0x5Au8; 10]);
    }

    #[test]
    fn missing_file_is_created_erased() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nvm.bin");

        let store = FileStore::open(&path, 32).unwrap();
        let mut buf = [0u8; 32];
        store.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == ERASED_BYTE));
        assert_eq!(fs::metadata(&path).unwrap().len(), 32);
    }
}
