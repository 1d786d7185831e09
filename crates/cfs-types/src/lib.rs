#![forbid(unsafe_code)]
//! Core newtypes and format constants shared by every chainfs crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device block size in bytes. Fixed for the lifetime of the format.
pub const BLOCK_SIZE: usize = 512;
/// Bits held by one bitmap page.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;
/// Number of slots in a block-map node (`next` pointer + 127 slots).
pub const SLOTS_PER_NODE: usize = (BLOCK_SIZE - 4) / 4;

/// "CFS1" in ASCII.
pub const CFS_MAGIC: u32 = 0x4346_5331;
/// Block 0 is the boot record; the filesystem starts here by default.
pub const DEFAULT_BLOCK_START: u32 = 1;
/// Share of usable blocks handed to the inode table, in percent.
pub const INODE_REGION_PERCENT: u64 = 20;

/// Longest single path component.
pub const NAME_MAX: usize = 255;
/// Longest path accepted anywhere, bounded by what a link record can hold.
pub const MAX_PATH_LEN: usize = BLOCK_SIZE - 2;
/// Symlink hops allowed before a lookup fails with `TooManyLinks`.
pub const MAX_LINK_DEPTH: u32 = 8;
/// Open devices tracked by one cache instance.
pub const MAX_DEVICES: usize = 8;
/// Full passes over a bitmap before the allocator reports no space.
pub const MAX_WRAP_PASSES: u32 = 2;

/// One device block worth of bytes.
pub type BlockBuf = [u8; BLOCK_SIZE];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// "No block": empty slot, end of chain, or unset pointer.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Distance from `base`, returning `None` if `self < base`.
    #[must_use]
    pub fn checked_sub(self, base: Self) -> Option<u32> {
        self.0.checked_sub(base.0)
    }

    /// Byte offset of this block on the device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * BLOCK_SIZE as u64
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Small integer handle for an open device; index into the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

// ── Permission bits ─────────────────────────────────────────────────────────

/// Nine independent permission bits laid out like POSIX `rwxrwxrwx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permissions(u16);

impl Permissions {
    pub const USER_READ: u16 = 0o400;
    pub const USER_WRITE: u16 = 0o200;
    pub const USER_EXEC: u16 = 0o100;
    pub const GROUP_READ: u16 = 0o040;
    pub const GROUP_WRITE: u16 = 0o020;
    pub const GROUP_EXEC: u16 = 0o010;
    pub const WORLD_READ: u16 = 0o004;
    pub const WORLD_WRITE: u16 = 0o002;
    pub const WORLD_EXEC: u16 = 0o001;

    pub const ALL: Self = Self(0o777);
    pub const NONE: Self = Self(0);

    /// Keep only the nine permission bits of `bits`.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0o777)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Clear every bit that is set in `umask`.
    #[must_use]
    pub const fn masked(self, umask: u16) -> Self {
        Self(self.0 & !umask & 0o777)
    }

    /// The `rwx` triple for the owner, as the low three bits.
    #[must_use]
    pub const fn user(self) -> u8 {
        ((self.0 >> 6) & 0o7) as u8
    }

    #[must_use]
    pub const fn group(self) -> u8 {
        ((self.0 >> 3) & 0o7) as u8
    }

    #[must_use]
    pub const fn world(self) -> u8 {
        (self.0 & 0o7) as u8
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SYMBOLS: [char; 3] = ['r', 'w', 'x'];
        for shift in (0..9).rev() {
            let set = (self.0 >> shift) & 1 == 1;
            let symbol = SYMBOLS[2 - (shift % 3) as usize];
            write!(f, "{}", if set { symbol } else { '-' })?;
        }
        Ok(())
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_helpers_round_trip_at_offsets() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 1, 0xBEEF).unwrap();
        write_le_u32(&mut buf, 3, 0xDEAD_BEEF).unwrap();
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(read_le_u16(&buf, 1).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 3).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(buf[8], 0x08);
    }

    #[test]
    fn reads_past_end_report_insufficient_data() {
        let buf = [0_u8; 4];
        assert_eq!(
            read_le_u32(&buf, 2),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 2,
                actual: 2
            })
        );
        let mut out = [0_u8; 4];
        assert!(write_le_u64(&mut out, 0, 1).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }

    #[test]
    fn block_node_layout_fills_one_block() {
        assert_eq!(SLOTS_PER_NODE, 127);
        assert_eq!(4 + SLOTS_PER_NODE * 4, BLOCK_SIZE);
        assert_eq!(BITS_PER_BLOCK, 4096);
    }

    #[test]
    fn null_block_is_zero() {
        assert!(BlockNumber::NULL.is_null());
        assert!(!BlockNumber(7).is_null());
        assert_eq!(BlockNumber(9).checked_sub(BlockNumber(4)), Some(5));
        assert_eq!(BlockNumber(3).checked_sub(BlockNumber(4)), None);
        assert_eq!(BlockNumber(2).byte_offset(), 1024);
    }

    #[test]
    fn permissions_split_into_triples() {
        let perm = Permissions::from_bits(0o1754);
        assert_eq!(perm.bits(), 0o754);
        assert_eq!(perm.user(), 0o7);
        assert_eq!(perm.group(), 0o5);
        assert_eq!(perm.world(), 0o4);
        assert_eq!(perm.to_string(), "rwxr-xr--");
        assert_eq!(Permissions::ALL.masked(0o022).bits(), 0o755);
    }

    #[test]
    fn newtypes_serialize_transparently_enough() {
        let json = serde_json::to_string(&BlockNumber(42)).unwrap();
        assert_eq!(json, "42");
        let back: DeviceId = serde_json::from_str("3").unwrap();
        assert_eq!(back, DeviceId(3));
        assert_eq!(back.to_string(), "dev3");
    }
}
