#![forbid(unsafe_code)]
//! Inode-slot and data-block allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** — raw bit manipulation on one bitmap page.
//! 2. **Resident page** — exactly one page of each bitmap is held in memory
//!    per device, chosen by the cursor stored in the master record.
//! 3. **SpaceAllocator** — per-device table of master records and resident
//!    pages; scans forward from the cursor, wrapping a bounded number of
//!    times, and writes the touched page and the master record back through
//!    the cache before returning.

use cfs_block::BlockCache;
use cfs_error::{CfsError, Result};
use cfs_ondisk::master::bitmap_blocks_for;
use cfs_ondisk::{BitmapCursor, MasterRecord, Region};
use cfs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BlockBuf, BlockNumber, DeviceId, MAX_DEVICES, MAX_WRAP_PASSES,
    ParseError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// First free bit in `start..count`, without wrapping.
#[must_use]
pub fn bitmap_next_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Which of the two bitmaps an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitmapKind {
    /// Inode-table slots.
    Inode,
    /// Data-region blocks.
    Data,
}

impl BitmapKind {
    fn label(self) -> &'static str {
        match self {
            Self::Inode => "inode",
            Self::Data => "data",
        }
    }
}

/// The one bitmap page of a bitmap kept in memory.
#[derive(Debug, Clone)]
struct ResidentPage {
    block: BlockNumber,
    bits: BlockBuf,
}

impl ResidentPage {
    fn load(cache: &mut BlockCache, dev: DeviceId, block: BlockNumber) -> Result<Self> {
        let mut bits = [0_u8; BLOCK_SIZE];
        cache.read(dev, block, &mut bits)?;
        Ok(Self { block, bits })
    }
}

#[derive(Debug)]
struct DeviceSpace {
    master: MasterRecord,
    inode_page: ResidentPage,
    data_page: ResidentPage,
}

/// Borrowed view of one bitmap of one device.
struct BitmapView<'a> {
    kind: BitmapKind,
    bitmap: Region,
    items: Region,
    cursor: &'a mut BitmapCursor,
    free: &'a mut u32,
    page: &'a mut ResidentPage,
}

impl DeviceSpace {
    fn view(&mut self, kind: BitmapKind) -> BitmapView<'_> {
        let master = &mut self.master;
        match kind {
            BitmapKind::Inode => BitmapView {
                kind,
                bitmap: master.inode_bitmap,
                items: master.inode_table,
                cursor: &mut master.inode_cursor,
                free: &mut master.free_inodes,
                page: &mut self.inode_page,
            },
            BitmapKind::Data => BitmapView {
                kind,
                bitmap: master.block_bitmap,
                items: master.data,
                cursor: &mut master.data_cursor,
                free: &mut master.free_blocks,
                page: &mut self.data_page,
            },
        }
    }
}

impl BitmapView<'_> {
    fn page_count(&self) -> u32 {
        bitmap_blocks_for(self.items.len())
    }

    /// Bits of `page_idx` that map onto real items.
    fn bits_in_page(&self, page_idx: u32) -> u32 {
        self.items
            .len()
            .saturating_sub(page_idx * BITS_PER_BLOCK)
            .min(BITS_PER_BLOCK)
    }

    fn page_block(&self, page_idx: u32) -> BlockNumber {
        BlockNumber(self.bitmap.start.0 + page_idx)
    }

    /// Make `page_idx` the resident page. The outgoing page has already been
    /// written back, so paging is a plain read.
    fn ensure_page(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        page_idx: u32,
    ) -> Result<()> {
        let block = self.page_block(page_idx);
        if self.page.block != block {
            cache.read(dev, block, &mut self.page.bits)?;
            self.page.block = block;
            trace!(dev = %dev, kind = self.kind.label(), page = block.0, "bitmap_page_in");
        }
        Ok(())
    }

    fn store_page(&self, cache: &mut BlockCache, dev: DeviceId) -> Result<()> {
        cache.write(dev, self.page.block, &self.page.bits)
    }

    /// Page index and bit of `block`; `Param` if it lies outside the region.
    fn locate(&self, block: BlockNumber) -> Result<(u32, u32)> {
        if !self.items.contains(block) {
            return Err(CfsError::Param(format!(
                "block {block} outside the {} region [{}, {})",
                self.kind.label(),
                self.items.start,
                self.items.end
            )));
        }
        let idx = block.0 - self.items.start.0;
        Ok((idx / BITS_PER_BLOCK, idx % BITS_PER_BLOCK))
    }

    fn cursor_page_idx(&self) -> u32 {
        self.cursor
            .page
            .checked_sub(self.bitmap.start)
            .unwrap_or(0)
            .min(self.page_count() - 1)
    }

    fn allocate(&mut self, cache: &mut BlockCache, dev: DeviceId) -> Result<BlockNumber> {
        let pages = self.page_count();
        let mut page_idx = self.cursor_page_idx();
        let mut bit = self.cursor.bit;
        let mut wraps = 0_u32;

        loop {
            self.ensure_page(cache, dev, page_idx)?;
            let count = self.bits_in_page(page_idx);
            if let Some(found) = bitmap_next_free(&self.page.bits, count, bit) {
                bitmap_set(&mut self.page.bits, found);
                self.store_page(cache, dev)?;
                *self.cursor = BitmapCursor {
                    page: self.page.block,
                    bit: found,
                };
                *self.free = self.free.saturating_sub(1);
                return Ok(BlockNumber(
                    self.items.start.0 + page_idx * BITS_PER_BLOCK + found,
                ));
            }

            page_idx += 1;
            bit = 0;
            if page_idx == pages {
                page_idx = 0;
                wraps += 1;
                if wraps > MAX_WRAP_PASSES {
                    debug!(dev = %dev, kind = self.kind.label(), wraps, "alloc_exhausted");
                    return Err(CfsError::NoSpace);
                }
            }
        }
    }

    /// Clear the bit of `block`. Returns `false` if it was already clear.
    fn release(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block: BlockNumber,
    ) -> Result<bool> {
        let (page_idx, bit) = self.locate(block)?;
        self.ensure_page(cache, dev, page_idx)?;
        if !bitmap_get(&self.page.bits, bit) {
            return Ok(false);
        }
        bitmap_clear(&mut self.page.bits, bit);
        self.store_page(cache, dev)?;
        *self.cursor = BitmapCursor {
            page: self.page.block,
            bit,
        };
        *self.free += 1;
        Ok(true)
    }

    /// Set the bit of a specific `block`. Returns `false` if it was already set.
    fn claim(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block: BlockNumber,
    ) -> Result<bool> {
        let (page_idx, bit) = self.locate(block)?;
        self.ensure_page(cache, dev, page_idx)?;
        if bitmap_get(&self.page.bits, bit) {
            return Ok(false);
        }
        bitmap_set(&mut self.page.bits, bit);
        self.store_page(cache, dev)?;
        *self.free = self.free.saturating_sub(1);
        Ok(true)
    }
}

fn write_master(cache: &mut BlockCache, dev: DeviceId, master: &MasterRecord) -> Result<()> {
    cache.write(dev, master.block_start, &master.to_block())
}

fn format_error(dev: DeviceId, err: &ParseError) -> CfsError {
    CfsError::Format(format!("{dev}: {err}"))
}

/// Per-device allocator state: one master record and two resident bitmap
/// pages for every mounted device.
#[derive(Debug)]
pub struct SpaceAllocator {
    devices: Vec<Option<DeviceSpace>>,
}

impl Default for SpaceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: (0..MAX_DEVICES).map(|_| None).collect(),
        }
    }

    /// Read and validate the master record at `block_start` and page in the
    /// bitmap pages its cursors point at.
    pub fn load(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block_start: BlockNumber,
    ) -> Result<MasterRecord> {
        if self.is_loaded(dev) {
            return Err(CfsError::Param(format!("{dev} is already mounted")));
        }
        let slot_count = self.devices.len();
        let slot = self
            .devices
            .get_mut(dev.index())
            .ok_or_else(|| CfsError::Param(format!("{dev} beyond {slot_count} device slots")))?;

        let mut raw = [0_u8; BLOCK_SIZE];
        cache.read(dev, block_start, &mut raw)?;
        let master = MasterRecord::parse_from_bytes(&raw).map_err(|err| format_error(dev, &err))?;
        if !master.initialized {
            return Err(CfsError::Format(format!("{dev}: filesystem not initialized")));
        }
        if master.block_start != block_start {
            return Err(CfsError::Format(format!(
                "{dev}: master record claims block_start={} but was found at {block_start}",
                master.block_start
            )));
        }
        let device_blocks = cache.block_count(dev)?;
        if master.total_blocks > device_blocks {
            return Err(CfsError::Format(format!(
                "{dev}: filesystem spans {} blocks but device has {device_blocks}",
                master.total_blocks
            )));
        }

        let inode_page = ResidentPage::load(cache, dev, master.inode_cursor.page)?;
        let data_page = ResidentPage::load(cache, dev, master.data_cursor.page)?;
        info!(
            dev = %dev,
            block_start = block_start.0,
            free_inodes = master.free_inodes,
            free_blocks = master.free_blocks,
            "allocator_loaded"
        );
        *slot = Some(DeviceSpace {
            master,
            inode_page,
            data_page,
        });
        Ok(master)
    }

    /// Write the master record back and forget the device.
    pub fn unload(&mut self, cache: &mut BlockCache, dev: DeviceId) -> Result<()> {
        let space = self.space(dev)?;
        write_master(cache, dev, &space.master)?;
        if let Some(slot) = self.devices.get_mut(dev.index()) {
            *slot = None;
        }
        info!(dev = %dev, "allocator_unloaded");
        Ok(())
    }

    #[must_use]
    pub fn is_loaded(&self, dev: DeviceId) -> bool {
        self.devices
            .get(dev.index())
            .is_some_and(Option::is_some)
    }

    /// The resident master record of `dev`.
    pub fn master(&self, dev: DeviceId) -> Result<&MasterRecord> {
        self.devices
            .get(dev.index())
            .and_then(Option::as_ref)
            .map(|space| &space.master)
            .ok_or_else(|| CfsError::Param(format!("{dev} is not mounted")))
    }

    fn space(&mut self, dev: DeviceId) -> Result<&mut DeviceSpace> {
        self.devices
            .get_mut(dev.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| CfsError::Param(format!("{dev} is not mounted")))
    }

    pub fn allocate_data_block(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
    ) -> Result<BlockNumber> {
        self.allocate(cache, dev, BitmapKind::Data)
    }

    pub fn allocate_inode_block(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
    ) -> Result<BlockNumber> {
        self.allocate(cache, dev, BitmapKind::Inode)
    }

    pub fn free_data_block(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block: BlockNumber,
    ) -> Result<()> {
        self.free(cache, dev, BitmapKind::Data, block)
    }

    pub fn free_inode_block(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block: BlockNumber,
    ) -> Result<()> {
        self.free(cache, dev, BitmapKind::Inode, block)
    }

    /// Allocate one item, persisting the bitmap page and master record
    /// before returning.
    pub fn allocate(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        kind: BitmapKind,
    ) -> Result<BlockNumber> {
        let space = self.space(dev)?;
        let block = space.view(kind).allocate(cache, dev)?;
        write_master(cache, dev, &space.master)?;
        debug!(dev = %dev, kind = kind.label(), block = block.0, "alloc_block");
        Ok(block)
    }

    /// Release one item. Freeing an already-free item is logged and ignored.
    pub fn free(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        kind: BitmapKind,
        block: BlockNumber,
    ) -> Result<()> {
        let space = self.space(dev)?;
        if !space.view(kind).release(cache, dev, block)? {
            warn!(dev = %dev, kind = kind.label(), block = block.0, "double_free_ignored");
            return Ok(());
        }
        write_master(cache, dev, &space.master)?;
        debug!(dev = %dev, kind = kind.label(), block = block.0, "free_block");
        Ok(())
    }

    /// Mark a specific inode slot as used. Used to materialize the root at
    /// the start of the inode table. Returns `false` if it was already taken.
    pub fn claim_inode_block(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        block: BlockNumber,
    ) -> Result<bool> {
        let space = self.space(dev)?;
        let claimed = space.view(BitmapKind::Inode).claim(cache, dev, block)?;
        if claimed {
            write_master(cache, dev, &space.master)?;
            debug!(dev = %dev, block = block.0, "claim_inode_block");
        }
        Ok(claimed)
    }

    /// Whether the bit of `block` is set.
    pub fn is_allocated(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        kind: BitmapKind,
        block: BlockNumber,
    ) -> Result<bool> {
        let space = self.space(dev)?;
        let view = space.view(kind);
        let (page_idx, bit) = view.locate(block)?;
        let mut page = [0_u8; BLOCK_SIZE];
        cache.read(dev, view.page_block(page_idx), &mut page)?;
        Ok(bitmap_get(&page, bit))
    }

    /// Recount free bits over the whole bitmap, independent of the counters
    /// kept in the master record.
    pub fn count_free_bits(
        &mut self,
        cache: &mut BlockCache,
        dev: DeviceId,
        kind: BitmapKind,
    ) -> Result<u32> {
        let space = self.space(dev)?;
        let view = space.view(kind);
        let mut page = [0_u8; BLOCK_SIZE];
        let mut free = 0_u32;
        for page_idx in 0..view.page_count() {
            cache.read(dev, view.page_block(page_idx), &mut page)?;
            free += bitmap_count_free(&page, view.bits_in_page(page_idx));
        }
        Ok(free)
    }
}
