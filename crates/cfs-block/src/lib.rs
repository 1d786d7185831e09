#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait (the raw device collaborator), a
//! file-backed and an in-memory device, and [`BlockCache`]: a fixed-capacity
//! cache shared by every open device with LRU replacement and dirty
//! write-back.

mod cache;

pub use cache::{BlockCache, CacheConfig, CacheStats};

use cfs_error::{CfsError, Result};
use cfs_types::{BLOCK_SIZE, BlockBuf, BlockNumber};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed device collaborator. Block size is fixed at `BLOCK_SIZE`.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`.
    fn read_block(&self, block: BlockNumber, buf: &mut BlockBuf) -> Result<()>;

    /// Write one block from `data`.
    fn write_block(&self, block: BlockNumber, data: &BlockBuf) -> Result<()>;

    /// Total number of blocks, including the reserved block 0.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Position hint issued before a read. A no-op unless the backend seeks.
    fn scan(&self, _block: BlockNumber) -> Result<()> {
        Ok(())
    }
}

fn check_block(block: BlockNumber, block_count: u32) -> Result<()> {
    if block.0 >= block_count {
        return Err(CfsError::Param(format!(
            "block out of range: block={block} block_count={block_count}"
        )));
    }
    Ok(())
}

/// File-backed device using `pread`/`pwrite` style I/O.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_count: u32,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an existing image, falling back to read-only if it is not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    /// Create (or truncate) an image of exactly `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(BlockNumber(block_count).byte_offset())?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        let block_size = BLOCK_SIZE as u64;
        let remainder = len % block_size;
        if remainder != 0 {
            return Err(CfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = u32::try_from(len / block_size).map_err(|_| {
            CfsError::Format(format!("image too large: {len} bytes exceeds u32 blocks"))
        })?;
        Ok(Self {
            file,
            block_count,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut BlockBuf) -> Result<()> {
        check_block(block, self.block_count)?;
        self.file.read_exact_at(buf, block.byte_offset())?;
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, data: &BlockBuf) -> Result<()> {
        if !self.writable {
            return Err(CfsError::PermissionDenied);
        }
        check_block(block, self.block_count)?;
        self.file.write_all_at(data, block.byte_offset())?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory device. Clones share the same storage, so a test can keep a
/// handle and inspect what actually reached the "disk".
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    block_count: u32,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        let len = usize::try_from(block_count).unwrap_or(0) * BLOCK_SIZE;
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
            block_count,
        }
    }

    /// Copy of a block as currently stored, bypassing any cache.
    pub fn snapshot(&self, block: BlockNumber) -> Result<BlockBuf> {
        let mut buf = [0_u8; BLOCK_SIZE];
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }

    fn range(&self, block: BlockNumber) -> Result<std::ops::Range<usize>> {
        check_block(block, self.block_count)?;
        let start = usize::try_from(block.byte_offset())
            .map_err(|_| CfsError::Param("offset overflow".to_owned()))?;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut BlockBuf) -> Result<()> {
        let range = self.range(block)?;
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[range]);
        drop(bytes);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, data: &BlockBuf) -> Result<()> {
        let range = self.range(block)?;
        let mut bytes = self.bytes.lock();
        bytes[range].copy_from_slice(data);
        drop(bytes);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_and_shares_storage() {
        let dev = MemBlockDevice::new(8);
        let handle = dev.clone();
        dev.write_block(BlockNumber(2), &[7_u8; BLOCK_SIZE]).unwrap();
        assert_eq!(handle.snapshot(BlockNumber(2)).unwrap(), [7_u8; BLOCK_SIZE]);
        assert_eq!(handle.snapshot(BlockNumber(3)).unwrap(), [0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0_u8; BLOCK_SIZE];
        assert!(matches!(
            dev.read_block(BlockNumber(4), &mut buf),
            Err(CfsError::Param(_))
        ));
        assert!(dev.write_block(BlockNumber(9), &buf).is_err());
    }

    #[test]
    fn file_device_create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let dev = FileBlockDevice::create(&path, 16).unwrap();
            assert_eq!(dev.block_count(), 16);
            dev.write_block(BlockNumber(5), &[0xAB; BLOCK_SIZE]).unwrap();
            dev.sync().unwrap();
        }
        let dev = FileBlockDevice::open(&path).unwrap();
        assert!(dev.is_writable());
        let mut buf = [0_u8; BLOCK_SIZE];
        dev.read_block(BlockNumber(5), &mut buf).unwrap();
        assert_eq!(buf, [0xAB; BLOCK_SIZE]);
        assert!(dev.read_block(BlockNumber(16), &mut buf).is_err());
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1000).unwrap();
        assert!(matches!(
            FileBlockDevice::open(file.path()),
            Err(CfsError::Format(_))
        ));
    }
}
