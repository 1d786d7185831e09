//! Master record: the per-device root structure at `block_start`.

use cfs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BlockBuf, BlockNumber, CFS_MAGIC, INODE_REGION_PERCENT,
    ParseError, read_le_u32, write_le_u32,
};
use serde::{Deserialize, Serialize};

const OFF_MAGIC: usize = 0;
const OFF_INITIALIZED: usize = 4;
const OFF_BLOCK_START: usize = 8;
const OFF_TOTAL_BLOCKS: usize = 12;
const OFF_INODE_BITMAP: usize = 16;
const OFF_BLOCK_BITMAP: usize = 24;
const OFF_INODE_TABLE: usize = 32;
const OFF_DATA: usize = 40;
const OFF_INODE_CURSOR: usize = 48;
const OFF_DATA_CURSOR: usize = 56;
const OFF_FREE_INODES: usize = 64;
const OFF_FREE_BLOCKS: usize = 68;

/// Half-open range of blocks `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl Region {
    #[must_use]
    pub fn new(start: u32, len: u32) -> Self {
        Self {
            start: BlockNumber(start),
            end: BlockNumber(start + len),
        }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.end.0.saturating_sub(self.start.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block >= self.start && block < self.end
    }

    fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            start: BlockNumber(read_le_u32(bytes, offset)?),
            end: BlockNumber(read_le_u32(bytes, offset + 4)?),
        })
    }

    fn write(self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(bytes, offset, self.start.0)?;
        write_le_u32(bytes, offset + 4, self.end.0)
    }
}

/// Position an allocator last used: bitmap page block and bit within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapCursor {
    pub page: BlockNumber,
    pub bit: u32,
}

impl BitmapCursor {
    #[must_use]
    pub fn at_start(bitmap: Region) -> Self {
        Self {
            page: bitmap.start,
            bit: 0,
        }
    }

    fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            page: BlockNumber(read_le_u32(bytes, offset)?),
            bit: read_le_u32(bytes, offset + 4)?,
        })
    }

    fn write(self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(bytes, offset, self.page.0)?;
        write_le_u32(bytes, offset + 4, self.bit)
    }
}

/// Decoded master record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub initialized: bool,
    pub block_start: BlockNumber,
    pub total_blocks: u32,
    pub inode_bitmap: Region,
    pub block_bitmap: Region,
    pub inode_table: Region,
    pub data: Region,
    pub inode_cursor: BitmapCursor,
    pub data_cursor: BitmapCursor,
    pub free_inodes: u32,
    pub free_blocks: u32,
}

/// Number of bitmap pages needed to track `count` items (at least one).
#[must_use]
pub fn bitmap_blocks_for(count: u32) -> u32 {
    count.div_ceil(BITS_PER_BLOCK).max(1)
}

impl MasterRecord {
    /// Compute the region layout for a fresh filesystem.
    ///
    /// `usable = total - block_start - 1`; 20% of usable blocks become the
    /// inode table, the rest is shared between the two bitmaps and the data
    /// region. Regions are contiguous and the data region ends at
    /// `total_blocks`.
    pub fn layout(block_start: u32, total_blocks: u32) -> Result<Self, ParseError> {
        if block_start == 0 {
            return Err(ParseError::InvalidField {
                field: "block_start",
                reason: "block 0 is reserved for the boot record",
            });
        }
        let usable = total_blocks
            .checked_sub(block_start)
            .and_then(|n| n.checked_sub(1))
            .ok_or(ParseError::InvalidField {
                field: "total_blocks",
                reason: "device ends before the master record",
            })?;

        let inode_count = u32::try_from(u64::from(usable) * INODE_REGION_PERCENT / 100)
            .map_err(|_| ParseError::InvalidField {
                field: "total_blocks",
                reason: "inode region overflows u32",
            })?;
        let inode_bitmap_len = bitmap_blocks_for(inode_count);
        let data_share = usable - inode_count;
        let after_inode_bitmap = data_share.saturating_sub(inode_bitmap_len);
        let block_bitmap_len = bitmap_blocks_for(after_inode_bitmap);
        let data_count = after_inode_bitmap.saturating_sub(block_bitmap_len);

        if inode_count == 0 || data_count == 0 {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "too small for an inode table and a data region",
            });
        }

        let inode_bitmap = Region::new(block_start + 1, inode_bitmap_len);
        let block_bitmap = Region::new(inode_bitmap.end.0, block_bitmap_len);
        let inode_table = Region::new(block_bitmap.end.0, inode_count);
        let data = Region::new(inode_table.end.0, data_count);

        Ok(Self {
            initialized: true,
            block_start: BlockNumber(block_start),
            total_blocks,
            inode_bitmap,
            block_bitmap,
            inode_table,
            data,
            inode_cursor: BitmapCursor::at_start(inode_bitmap),
            data_cursor: BitmapCursor::at_start(block_bitmap),
            free_inodes: inode_count,
            free_blocks: data_count,
        })
    }

    /// Decode a master record block, checking the magic number.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, OFF_MAGIC)?;
        if magic != CFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: CFS_MAGIC,
                actual: magic,
            });
        }

        let record = Self {
            initialized: read_le_u32(bytes, OFF_INITIALIZED)? != 0,
            block_start: BlockNumber(read_le_u32(bytes, OFF_BLOCK_START)?),
            total_blocks: read_le_u32(bytes, OFF_TOTAL_BLOCKS)?,
            inode_bitmap: Region::parse(bytes, OFF_INODE_BITMAP)?,
            block_bitmap: Region::parse(bytes, OFF_BLOCK_BITMAP)?,
            inode_table: Region::parse(bytes, OFF_INODE_TABLE)?,
            data: Region::parse(bytes, OFF_DATA)?,
            inode_cursor: BitmapCursor::parse(bytes, OFF_INODE_CURSOR)?,
            data_cursor: BitmapCursor::parse(bytes, OFF_DATA_CURSOR)?,
            free_inodes: read_le_u32(bytes, OFF_FREE_INODES)?,
            free_blocks: read_le_u32(bytes, OFF_FREE_BLOCKS)?,
        };
        record.validate_geometry()?;
        Ok(record)
    }

    /// Encode into a full block; unused bytes are zero.
    #[must_use]
    pub fn to_block(&self) -> BlockBuf {
        let mut buf = [0_u8; BLOCK_SIZE];
        let written = self.write_fields(&mut buf);
        debug_assert!(written.is_ok(), "master field offsets exceed the block");
        buf
    }

    fn write_fields(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(buf, OFF_MAGIC, CFS_MAGIC)?;
        write_le_u32(buf, OFF_INITIALIZED, u32::from(self.initialized))?;
        write_le_u32(buf, OFF_BLOCK_START, self.block_start.0)?;
        write_le_u32(buf, OFF_TOTAL_BLOCKS, self.total_blocks)?;
        self.inode_bitmap.write(buf, OFF_INODE_BITMAP)?;
        self.block_bitmap.write(buf, OFF_BLOCK_BITMAP)?;
        self.inode_table.write(buf, OFF_INODE_TABLE)?;
        self.data.write(buf, OFF_DATA)?;
        self.inode_cursor.write(buf, OFF_INODE_CURSOR)?;
        self.data_cursor.write(buf, OFF_DATA_CURSOR)?;
        write_le_u32(buf, OFF_FREE_INODES, self.free_inodes)?;
        write_le_u32(buf, OFF_FREE_BLOCKS, self.free_blocks)
    }

    /// Check that the regions are ordered, contiguous, and inside the device,
    /// and that both cursors point into their bitmaps.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let first = self
            .block_start
            .0
            .checked_add(1)
            .ok_or(ParseError::InvalidField {
                field: "block_start",
                reason: "no room for the regions after the master record",
            })?;
        let ordered = [
            (first, self.inode_bitmap),
            (self.inode_bitmap.end.0, self.block_bitmap),
            (self.block_bitmap.end.0, self.inode_table),
            (self.inode_table.end.0, self.data),
        ];
        for (expected_start, region) in ordered {
            if region.start.0 != expected_start || region.end < region.start {
                return Err(ParseError::InvalidField {
                    field: "regions",
                    reason: "regions are not contiguous",
                });
            }
        }
        if self.data.end.0 > self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "data_end",
                reason: "data region extends past the device",
            });
        }
        if self.inode_bitmap.len() < bitmap_blocks_for(self.inode_table.len())
            || self.block_bitmap.len() < bitmap_blocks_for(self.data.len())
        {
            return Err(ParseError::InvalidField {
                field: "bitmaps",
                reason: "bitmap region too small for its items",
            });
        }
        if !self.inode_bitmap.contains(self.inode_cursor.page)
            || !self.block_bitmap.contains(self.data_cursor.page)
            || self.inode_cursor.bit > BITS_PER_BLOCK
            || self.data_cursor.bit > BITS_PER_BLOCK
        {
            return Err(ParseError::InvalidField {
                field: "cursor",
                reason: "allocator cursor outside its bitmap",
            });
        }
        Ok(())
    }
}
