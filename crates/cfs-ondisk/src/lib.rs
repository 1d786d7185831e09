#![forbid(unsafe_code)]
//! On-disk format codecs for chainfs.
//!
//! Pure parsing crate, no I/O. Turns 512-byte blocks into typed records
//! (master record, inodes, block-map nodes, link records) and back, and
//! computes the region layout of a fresh device.

pub mod blockmap;
pub mod inode;
pub mod master;

pub use blockmap::{BlockMapNode, LinkRecord};
pub use inode::{FileCursor, Inode, InodeKind, InodeName};
pub use master::{BitmapCursor, MasterRecord, Region};

use cfs_error::CfsError;
use cfs_types::{BlockNumber, ParseError};

/// Attach the block number to a codec failure found while reading live data.
#[must_use]
pub fn parse_error_at(block: BlockNumber, err: &ParseError) -> CfsError {
    CfsError::inconsistent(block.0, err.to_string())
}
