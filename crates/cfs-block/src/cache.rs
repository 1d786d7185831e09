//! Fixed-capacity multi-device block cache.
//!
//! Every higher layer reaches the disk only through [`BlockCache`]. Slots are
//! keyed by `(device, block)`; writes land in the cache and are flushed on
//! eviction, `free`, `sync`, or `close`.
//!
//! Replacement on a miss makes a single pass over all slots starting at the
//! advisory `curr` pointer and picks, in order of preference: the first FREE
//! slot, the clean slot with the lowest LRU counter, the dirty slot with the
//! lowest LRU counter. A dirty victim is written to its own `(device, block)`
//! before the slot is reused. A touched slot's counter becomes `highest + 1`
//! and saturates at `u32::MAX`.

use crate::{BlockDevice, FileBlockDevice};
use cfs_error::{CfsError, Result};
use cfs_types::{BLOCK_SIZE, BlockBuf, BlockNumber, DeviceId, MAX_DEVICES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of block slots, fixed for the cache's lifetime. Must be > 0.
    pub capacity_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 64,
        }
    }
}

/// Running counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Occupied slots reused for a different block.
    pub evictions: u64,
    /// Dirty blocks written to a device.
    pub writebacks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotKey {
    dev: DeviceId,
    block: BlockNumber,
}

#[derive(Debug)]
struct Slot {
    buf: BlockBuf,
    /// `None` is the FREE sentinel.
    key: Option<SlotKey>,
    dirty: bool,
    lru: u32,
}

impl Slot {
    const fn free() -> Self {
        Self {
            buf: [0; BLOCK_SIZE],
            key: None,
            dirty: false,
            lru: 0,
        }
    }

    fn release(&mut self) {
        self.key = None;
        self.dirty = false;
        self.lru = 0;
    }
}

struct DeviceEntry {
    name: String,
    device: Box<dyn BlockDevice>,
}

/// Outcome of one pass over the slot table.
#[derive(Debug, Default)]
struct Scan {
    hit: Option<usize>,
    free: Option<usize>,
    clean: Option<usize>,
    dirty: Option<usize>,
    highest: u32,
}

fn device_ref(devices: &[Option<DeviceEntry>], dev: DeviceId) -> Result<&dyn BlockDevice> {
    devices
        .get(dev.index())
        .and_then(Option::as_ref)
        .map(|entry| entry.device.as_ref())
        .ok_or_else(|| CfsError::Param(format!("{dev} is not open")))
}

pub struct BlockCache {
    slots: Vec<Slot>,
    devices: Vec<Option<DeviceEntry>>,
    /// Advisory scan start; the slot touched last.
    curr: usize,
    stats: CacheStats,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .devices
            .iter()
            .flatten()
            .map(|entry| entry.name.as_str())
            .collect();
        f.debug_struct("BlockCache")
            .field("capacity", &self.slots.len())
            .field("resident", &self.resident_count())
            .field("devices", &names)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.capacity_blocks == 0 {
            return Err(CfsError::Param(
                "BlockCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            slots: (0..config.capacity_blocks).map(|_| Slot::free()).collect(),
            devices: (0..MAX_DEVICES).map(|_| None).collect(),
            curr: 0,
            stats: CacheStats::default(),
        })
    }

    // ── Device table ────────────────────────────────────────────────────────

    /// Open a file-backed device and register it under its path.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<DeviceId> {
        let name = path.as_ref().display().to_string();
        if self.find_device(&name).is_some() {
            return Err(CfsError::Param(format!("device already open: {name}")));
        }
        let device = FileBlockDevice::open(path.as_ref())?;
        self.attach(name, Box::new(device))
    }

    /// Register an already-constructed device under `name`.
    pub fn attach(
        &mut self,
        name: impl Into<String>,
        device: Box<dyn BlockDevice>,
    ) -> Result<DeviceId> {
        let name = name.into();
        if name.is_empty() {
            return Err(CfsError::Param("empty device name".to_owned()));
        }
        if self.find_device(&name).is_some() {
            return Err(CfsError::Param(format!("device already open: {name}")));
        }
        let idx = self
            .devices
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                CfsError::Fail(format!("device table full ({MAX_DEVICES} devices)"))
            })?;
        let dev = DeviceId(
            u32::try_from(idx)
                .map_err(|_| CfsError::Fail("device index overflow".to_owned()))?,
        );
        info!(
            dev = %dev,
            name = name.as_str(),
            blocks = device.block_count(),
            "device_attached"
        );
        self.devices[idx] = Some(DeviceEntry { name, device });
        Ok(dev)
    }

    /// Flush every dirty block of `dev`, drop its slots, and release the
    /// device. If the flush fails the device stays open with its dirty blocks.
    pub fn close(&mut self, dev: DeviceId) -> Result<()> {
        self.sync(dev)?;
        for slot in &mut self.slots {
            if slot.key.is_some_and(|key| key.dev == dev) {
                slot.release();
            }
        }
        if let Some(entry) = self.devices.get_mut(dev.index()).and_then(Option::take) {
            info!(dev = %dev, name = entry.name.as_str(), "device_closed");
        }
        Ok(())
    }

    #[must_use]
    pub fn find_device(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|e| e.name == name))
            .and_then(|idx| u32::try_from(idx).ok())
            .map(DeviceId)
    }

    pub fn device_name(&self, dev: DeviceId) -> Result<&str> {
        self.devices
            .get(dev.index())
            .and_then(Option::as_ref)
            .map(|entry| entry.name.as_str())
            .ok_or_else(|| CfsError::Param(format!("{dev} is not open")))
    }

    pub fn block_count(&self, dev: DeviceId) -> Result<u32> {
        Ok(device_ref(&self.devices, dev)?.block_count())
    }

    fn check_range(&self, dev: DeviceId, block: BlockNumber) -> Result<()> {
        let count = self.block_count(dev)?;
        if block.0 >= count {
            return Err(CfsError::Param(format!(
                "block out of range on {dev}: block={block} block_count={count}"
            )));
        }
        Ok(())
    }

    // ── Block access ────────────────────────────────────────────────────────

    /// Copy `(dev, block)` into `out`, loading it from the device on a miss.
    pub fn read(&mut self, dev: DeviceId, block: BlockNumber, out: &mut BlockBuf) -> Result<()> {
        self.check_range(dev, block)?;
        let key = SlotKey { dev, block };
        let scan = self.scan(key);

        if let Some(idx) = scan.hit {
            self.stats.hits += 1;
            trace!(dev = %dev, block = block.0, slot = idx, "cache_hit");
            *out = self.slots[idx].buf;
            self.touch(idx, scan.highest);
            return Ok(());
        }

        self.stats.misses += 1;
        let idx = self.claim_slot(&scan)?;
        trace!(dev = %dev, block = block.0, slot = idx, "cache_miss");

        let device = device_ref(&self.devices, dev)?;
        let slot = &mut self.slots[idx];
        let loaded = device
            .scan(block)
            .and_then(|()| device.read_block(block, &mut slot.buf));
        if let Err(err) = loaded {
            slot.release();
            return Err(err);
        }
        slot.key = Some(key);
        slot.dirty = false;
        *out = slot.buf;
        self.touch(idx, scan.highest);
        Ok(())
    }

    /// Store `data` as the new contents of `(dev, block)`. The device is not
    /// touched until the block is flushed.
    pub fn write(&mut self, dev: DeviceId, block: BlockNumber, data: &BlockBuf) -> Result<()> {
        self.check_range(dev, block)?;
        let key = SlotKey { dev, block };
        let scan = self.scan(key);

        let idx = if let Some(idx) = scan.hit {
            self.stats.hits += 1;
            trace!(dev = %dev, block = block.0, slot = idx, "cache_write_hit");
            idx
        } else {
            self.stats.misses += 1;
            let idx = self.claim_slot(&scan)?;
            trace!(dev = %dev, block = block.0, slot = idx, "cache_write_miss");
            idx
        };

        let slot = &mut self.slots[idx];
        slot.buf = *data;
        slot.key = Some(key);
        slot.dirty = true;
        self.touch(idx, scan.highest);
        Ok(())
    }

    /// Evict `(dev, block)`, flushing it first if dirty. Not resident is a no-op.
    pub fn free(&mut self, dev: DeviceId, block: BlockNumber) -> Result<()> {
        self.check_range(dev, block)?;
        let Some(idx) = self.position(SlotKey { dev, block }) else {
            return Ok(());
        };
        let slot = &mut self.slots[idx];
        if slot.dirty {
            device_ref(&self.devices, dev)?.write_block(block, &slot.buf)?;
            self.stats.writebacks += 1;
        }
        slot.release();
        trace!(dev = %dev, block = block.0, slot = idx, "cache_free");
        Ok(())
    }

    /// Flush every dirty slot of `dev`. A failing block is logged, keeps its
    /// dirty bit, and does not stop the remaining flushes; the call then
    /// reports `Fail`.
    pub fn sync(&mut self, dev: DeviceId) -> Result<()> {
        let device = device_ref(&self.devices, dev)?;
        let mut flushed = 0_u64;
        let mut failed = 0_u64;
        for slot in &mut self.slots {
            let Some(key) = slot.key else { continue };
            if key.dev != dev || !slot.dirty {
                continue;
            }
            match device.write_block(key.block, &slot.buf) {
                Ok(()) => {
                    slot.dirty = false;
                    flushed += 1;
                }
                Err(err) => {
                    warn!(dev = %dev, block = key.block.0, error = %err, "cache_flush_failed");
                    failed += 1;
                }
            }
        }
        self.stats.writebacks += flushed;
        debug!(dev = %dev, flushed, failed, "cache_sync");
        if failed > 0 {
            return Err(CfsError::Fail(format!(
                "{failed} dirty blocks could not be flushed to {dev}"
            )));
        }
        device.sync()
    }

    // ── Introspection ───────────────────────────────────────────────────────

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.key.is_some()).count()
    }

    #[must_use]
    pub fn is_resident(&self, dev: DeviceId, block: BlockNumber) -> bool {
        self.position(SlotKey { dev, block }).is_some()
    }

    #[must_use]
    pub fn is_dirty(&self, dev: DeviceId, block: BlockNumber) -> bool {
        self.position(SlotKey { dev, block })
            .is_some_and(|idx| self.slots[idx].dirty)
    }

    /// Dirty slots belonging to `dev`.
    #[must_use]
    pub fn dirty_count(&self, dev: DeviceId) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.dirty && slot.key.is_some_and(|key| key.dev == dev))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    // ── Replacement ─────────────────────────────────────────────────────────

    fn position(&self, key: SlotKey) -> Option<usize> {
        self.slots.iter().position(|slot| slot.key == Some(key))
    }

    fn scan(&self, key: SlotKey) -> Scan {
        let mut out = Scan::default();
        let len = self.slots.len();
        for step in 0..len {
            let idx = (self.curr + step) % len;
            let slot = &self.slots[idx];
            let Some(slot_key) = slot.key else {
                if out.free.is_none() {
                    out.free = Some(idx);
                }
                continue;
            };
            out.highest = out.highest.max(slot.lru);
            if slot_key == key {
                out.hit = Some(idx);
                continue;
            }
            let candidate = if slot.dirty {
                &mut out.dirty
            } else {
                &mut out.clean
            };
            if candidate.is_none_or(|best| slot.lru < self.slots[best].lru) {
                *candidate = Some(idx);
            }
        }
        out
    }

    /// Pick the miss victim and empty it, writing it back first if dirty.
    /// If the write-back fails the victim keeps its contents and dirty bit.
    fn claim_slot(&mut self, scan: &Scan) -> Result<usize> {
        if let Some(idx) = scan.free {
            return Ok(idx);
        }
        let idx = scan
            .clean
            .or(scan.dirty)
            .ok_or_else(|| CfsError::Fail("no replaceable cache slot".to_owned()))?;

        let slot = &mut self.slots[idx];
        if let Some(victim) = slot.key {
            if slot.dirty {
                let device = device_ref(&self.devices, victim.dev).map_err(|_| {
                    CfsError::Fail(format!("dirty slot {idx} belongs to closed {}", victim.dev))
                })?;
                device.write_block(victim.block, &slot.buf)?;
                self.stats.writebacks += 1;
            }
            debug!(
                victim_dev = %victim.dev,
                victim_block = victim.block.0,
                dirty = slot.dirty,
                lru = slot.lru,
                slot = idx,
                "cache_evict"
            );
            self.stats.evictions += 1;
        }
        slot.release();
        Ok(idx)
    }

    fn touch(&mut self, idx: usize, highest: u32) {
        self.slots[idx].lru = highest.saturating_add(1);
        self.curr = idx;
    }
}
