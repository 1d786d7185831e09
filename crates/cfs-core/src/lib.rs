#![forbid(unsafe_code)]
//! chainfs context object.
//!
//! [`Filesystem`] owns every table the engine needs: the block cache with
//! its device table, the allocator's per-device master records and resident
//! bitmap pages, and the credentials operations run under. Each call borrows
//! what it needs for its own duration, so there is no hidden global state and
//! exactly one operation runs at a time.
//!
//! Devices go through three stages: registered with the cache
//! ([`Filesystem::open_device`] / [`Filesystem::attach_device`]), formatted
//! ([`Filesystem::create_fs`]), and mounted ([`Filesystem::dev_open`]).
//! [`Filesystem::dev_close`] flushes and releases a device.

mod attr;
mod config;
mod handle;
mod ops;

pub use attr::{FsStats, InodeAttr};
pub use config::{MkfsOptions, OpenOptions};
pub use handle::{OpenFile, OpenFlags};

pub use cfs_block::{
    BlockCache, BlockDevice, CacheConfig, CacheStats, FileBlockDevice, MemBlockDevice,
};
pub use cfs_error::{CfsError, Result};
pub use cfs_inode::{AccessMode, Credentials};
pub use cfs_ondisk::{InodeKind, MasterRecord};
pub use cfs_types::{BLOCK_SIZE, BlockNumber, DeviceId, Permissions};

use cfs_alloc::{BitmapKind, SpaceAllocator};
use cfs_inode::InodeEngine;
use std::path::Path;
use tracing::{info, warn};

/// Cache, allocator, and identity for a set of chainfs devices.
pub struct Filesystem {
    cache: BlockCache,
    alloc: SpaceAllocator,
    creds: Credentials,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("cache", &self.cache)
            .field("creds", &self.creds)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Ok(Self {
            cache: BlockCache::new(config)?,
            alloc: SpaceAllocator::new(),
            creds: Credentials::default(),
        })
    }

    #[must_use]
    pub fn with_credentials(mut self, creds: Credentials) -> Self {
        self.creds = creds;
        self
    }

    pub fn set_credentials(&mut self, creds: Credentials) {
        self.creds = creds;
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    /// Read-only view of the cache for statistics and residency checks.
    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn engine(&mut self, dev: DeviceId) -> InodeEngine<'_> {
        InodeEngine::new(&mut self.cache, &mut self.alloc, dev, self.creds)
    }

    // ── Devices ─────────────────────────────────────────────────────────────

    /// Register a file-backed image under its path.
    pub fn open_device(&mut self, path: impl AsRef<Path>) -> Result<DeviceId> {
        self.cache.open(path)
    }

    pub fn attach_device(
        &mut self,
        name: impl Into<String>,
        device: Box<dyn BlockDevice>,
    ) -> Result<DeviceId> {
        self.cache.attach(name, device)
    }

    /// Format `dev`: zero both bitmaps and the root slot, then write a fresh
    /// master record. The device must not be mounted.
    pub fn create_fs(&mut self, dev: DeviceId, opts: &MkfsOptions) -> Result<MasterRecord> {
        if self.alloc.is_loaded(dev) {
            return Err(CfsError::Busy(format!("{dev} is mounted")));
        }
        let device_blocks = self.cache.block_count(dev)?;
        let total = opts.total_blocks.unwrap_or(device_blocks);
        if total > device_blocks {
            return Err(CfsError::Param(format!(
                "{total} blocks requested but {dev} has {device_blocks}"
            )));
        }
        let master = MasterRecord::layout(opts.block_start, total)
            .map_err(|err| CfsError::Format(format!("{dev}: {err}")))?;

        let zero = [0_u8; BLOCK_SIZE];
        for block in master.inode_bitmap.start.0..master.block_bitmap.end.0 {
            self.cache.write(dev, BlockNumber(block), &zero)?;
        }
        self.cache.write(dev, master.inode_table.start, &zero)?;
        self.cache.write(dev, master.block_start, &master.to_block())?;
        self.cache.sync(dev)?;
        info!(
            dev = %dev,
            block_start = master.block_start.0,
            total_blocks = master.total_blocks,
            inodes = master.inode_table.len(),
            data_blocks = master.data.len(),
            "mkfs"
        );
        Ok(master)
    }

    /// Load the master record of a formatted device and make sure its root
    /// directory exists.
    pub fn dev_open(&mut self, dev: DeviceId, opts: &OpenOptions) -> Result<MasterRecord> {
        self.alloc
            .load(&mut self.cache, dev, BlockNumber(opts.block_start))?;
        let root = match self.engine(dev).root() {
            Ok(root) => root,
            Err(err) => {
                if let Err(unload_err) = self.alloc.unload(&mut self.cache, dev) {
                    warn!(dev = %dev, error = %unload_err, "unload_after_failed_mount");
                }
                return Err(err);
            }
        };
        let master = *self.alloc.master(dev)?;
        info!(dev = %dev, root = root.self_block.0, "mount");
        Ok(master)
    }

    /// Open the image at `path` and mount it.
    pub fn mount(&mut self, path: impl AsRef<Path>, opts: &OpenOptions) -> Result<DeviceId> {
        let dev = self.open_device(path)?;
        if let Err(err) = self.dev_open(dev, opts) {
            if let Err(close_err) = self.cache.close(dev) {
                warn!(dev = %dev, error = %close_err, "close_after_failed_mount");
            }
            return Err(err);
        }
        Ok(dev)
    }

    /// Flush `dev`, write its master record back, and release it. A failed
    /// flush leaves the device mounted with its dirty blocks.
    pub fn dev_close(&mut self, dev: DeviceId) -> Result<()> {
        self.cache.sync(dev)?;
        if self.alloc.is_loaded(dev) {
            self.alloc.unload(&mut self.cache, dev)?;
        }
        self.cache.close(dev)?;
        info!(dev = %dev, "unmount");
        Ok(())
    }

    /// The resident master record of a mounted device.
    pub fn master(&self, dev: DeviceId) -> Result<&MasterRecord> {
        self.alloc.master(dev)
    }

    /// Capacity figures recounted from the bitmaps themselves rather than
    /// the master record counters.
    pub fn scan_free_space(&mut self, dev: DeviceId) -> Result<FsStats> {
        let mut stats = FsStats::from(self.alloc.master(dev)?);
        stats.free_inodes = self
            .alloc
            .count_free_bits(&mut self.cache, dev, BitmapKind::Inode)?;
        stats.free_blocks = self
            .alloc
            .count_free_bits(&mut self.cache, dev, BitmapKind::Data)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted(blocks: u32) -> (Filesystem, DeviceId) {
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs
            .attach_device("mem", Box::new(MemBlockDevice::new(blocks)))
            .unwrap();
        fs.create_fs(dev, &MkfsOptions::default()).unwrap();
        (fs, dev)
    }

    #[test]
    fn mkfs_then_mount_claims_only_the_root() {
        let (mut fs, dev) = formatted(2048);
        let master = fs.dev_open(dev, &OpenOptions::default()).unwrap();
        assert_eq!(master.free_inodes, master.inode_table.len() - 1);
        let stats = fs.statfs(dev).unwrap();
        assert_eq!(stats, fs.scan_free_space(dev).unwrap());
        assert_eq!(stats.block_size, 512);
        let root = fs.stat(dev, "/").unwrap();
        assert_eq!(root.kind, InodeKind::Directory);
        assert_eq!(root.ino, master.inode_table.start);
    }

    #[test]
    fn mkfs_respects_requested_size_and_start() {
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs
            .attach_device("mem", Box::new(MemBlockDevice::new(4096)))
            .unwrap();
        let opts = MkfsOptions {
            block_start: 8,
            total_blocks: Some(1024),
        };
        let master = fs.create_fs(dev, &opts).unwrap();
        assert_eq!(master.block_start, BlockNumber(8));
        assert_eq!(master.data.end, BlockNumber(1024));
        assert!(matches!(
            fs.dev_open(dev, &OpenOptions::default()),
            Err(CfsError::Format(_))
        ));
        fs.dev_open(dev, &OpenOptions { block_start: 8 }).unwrap();

        // Formatting a mounted device is refused.
        assert!(matches!(fs.create_fs(dev, &opts), Err(CfsError::Busy(_))));
    }

    #[test]
    fn mkfs_rejects_oversized_and_tiny_geometry() {
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs
            .attach_device("mem", Box::new(MemBlockDevice::new(64)))
            .unwrap();
        let too_big = MkfsOptions {
            total_blocks: Some(65),
            ..MkfsOptions::default()
        };
        assert!(matches!(fs.create_fs(dev, &too_big), Err(CfsError::Param(_))));
        let tiny = MkfsOptions {
            total_blocks: Some(4),
            ..MkfsOptions::default()
        };
        assert!(matches!(fs.create_fs(dev, &tiny), Err(CfsError::Format(_))));
    }

    #[test]
    fn unformatted_device_does_not_mount() {
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs
            .attach_device("blank", Box::new(MemBlockDevice::new(128)))
            .unwrap();
        assert!(matches!(
            fs.dev_open(dev, &OpenOptions::default()),
            Err(CfsError::Format(_))
        ));
    }

    #[test]
    fn close_writes_everything_back() {
        let device = MemBlockDevice::new(1024);
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs.attach_device("mem", Box::new(device.clone())).unwrap();
        fs.create_fs(dev, &MkfsOptions::default()).unwrap();
        fs.dev_open(dev, &OpenOptions::default()).unwrap();
        fs.mkdir(dev, "/d", Permissions::ALL).unwrap();
        let master = *fs.master(dev).unwrap();
        fs.dev_close(dev).unwrap();
        assert!(fs.master(dev).is_err());

        let mut again = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = again.attach_device("mem", Box::new(device)).unwrap();
        let reloaded = again.dev_open(dev, &OpenOptions::default()).unwrap();
        assert_eq!(reloaded, master);
        assert_eq!(again.stat(dev, "/d").unwrap().kind, InodeKind::Directory);
    }
}
