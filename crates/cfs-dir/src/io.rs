//! Typed block I/O through the cache.
//!
//! Every decode failure is reported as `Inconsistent` at the block it was
//! read from.

use cfs_alloc::SpaceAllocator;
use cfs_block::BlockCache;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{BlockMapNode, Inode, LinkRecord, parse_error_at};
use cfs_types::{BLOCK_SIZE, BlockNumber, DeviceId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, for inode timestamps.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn require_block(block: BlockNumber, what: &str) -> Result<()> {
    if block.is_null() {
        return Err(CfsError::Param(format!("null {what} block")));
    }
    Ok(())
}

/// Decode the inode at `block`; `None` if the slot is free.
pub fn read_inode_opt(
    cache: &mut BlockCache,
    dev: DeviceId,
    block: BlockNumber,
) -> Result<Option<Inode>> {
    require_block(block, "inode")?;
    let mut raw = [0_u8; BLOCK_SIZE];
    cache.read(dev, block, &mut raw)?;
    Inode::parse_from_bytes(&raw).map_err(|err| parse_error_at(block, &err))
}

/// Decode the inode at `block`, which must be in use.
pub fn read_inode(cache: &mut BlockCache, dev: DeviceId, block: BlockNumber) -> Result<Inode> {
    let inode = read_inode_opt(cache, dev, block)?
        .ok_or_else(|| CfsError::inconsistent(block.0, "expected an inode, found a free slot"))?;
    if inode.self_block != block {
        return Err(CfsError::inconsistent(
            block.0,
            format!("inode claims self={}", inode.self_block),
        ));
    }
    Ok(inode)
}

pub fn write_inode(cache: &mut BlockCache, dev: DeviceId, inode: &Inode) -> Result<()> {
    require_block(inode.self_block, "inode")?;
    cache.write(dev, inode.self_block, &inode.to_block())
}

pub fn read_node(cache: &mut BlockCache, dev: DeviceId, block: BlockNumber) -> Result<BlockMapNode> {
    require_block(block, "block-map node")?;
    let mut raw = [0_u8; BLOCK_SIZE];
    cache.read(dev, block, &mut raw)?;
    BlockMapNode::parse_from_bytes(&raw).map_err(|err| parse_error_at(block, &err))
}

pub fn write_node(
    cache: &mut BlockCache,
    dev: DeviceId,
    block: BlockNumber,
    node: &BlockMapNode,
) -> Result<()> {
    require_block(block, "block-map node")?;
    cache.write(dev, block, &node.to_block())
}

pub fn read_link(cache: &mut BlockCache, dev: DeviceId, block: BlockNumber) -> Result<LinkRecord> {
    require_block(block, "link record")?;
    let mut raw = [0_u8; BLOCK_SIZE];
    cache.read(dev, block, &mut raw)?;
    LinkRecord::parse_from_bytes(&raw).map_err(|err| parse_error_at(block, &err))
}

pub fn write_link(
    cache: &mut BlockCache,
    dev: DeviceId,
    block: BlockNumber,
    link: &LinkRecord,
) -> Result<()> {
    require_block(block, "link record")?;
    cache.write(dev, block, &link.to_block())
}

/// Allocate a data-region block and fill it with zeros, so it reads as an
/// empty node, an empty link record, or a hole.
pub fn allocate_zeroed(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
) -> Result<BlockNumber> {
    let block = alloc.allocate_data_block(cache, dev)?;
    cache.write(dev, block, &[0_u8; BLOCK_SIZE])?;
    Ok(block)
}

/// Evict a data-region block from the cache and clear its bitmap bit.
pub fn release_data_block(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    block: BlockNumber,
) -> Result<()> {
    cache.free(dev, block)?;
    alloc.free_data_block(cache, dev, block)
}
