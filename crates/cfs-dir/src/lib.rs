#![forbid(unsafe_code)]
//! Directory operations over block-map chains.
//!
//! A directory's `next` field heads a chain of [`BlockMapNode`]s whose filled
//! slots are child inode blocks. Lookup is a linear scan comparing names.
//! Insertion takes the first empty slot anywhere in the chain, appending a
//! node when all are full. Removal clears the slot and unlinks the node from
//! the chain once it holds nothing.
//!
//! The same chain walk serves file data chains, so [`visit_chain`] and
//! [`free_chain`] are shared with the file I/O engine.

pub mod io;

pub use io::{
    allocate_zeroed, read_inode, read_inode_opt, read_link, read_node, release_data_block,
    unix_now, write_inode, write_link, write_node,
};

use cfs_alloc::SpaceAllocator;
use cfs_block::BlockCache;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{BlockMapNode, Inode};
use cfs_types::{BlockNumber, DeviceId};
use std::ops::ControlFlow;
use tracing::{debug, trace};

/// Walk the chain starting at `head`, handing each node to `visit` until it
/// breaks. A chain longer than the device is reported as a cycle.
pub fn visit_chain<T>(
    cache: &mut BlockCache,
    dev: DeviceId,
    head: BlockNumber,
    mut visit: impl FnMut(&mut BlockCache, BlockNumber, &BlockMapNode) -> Result<ControlFlow<T>>,
) -> Result<Option<T>> {
    let limit = cache.block_count(dev)?;
    let mut current = head;
    let mut hops = 0_u32;
    while !current.is_null() {
        hops += 1;
        if hops > limit {
            return Err(CfsError::inconsistent(
                head.0,
                "block-map chain does not terminate",
            ));
        }
        let node = read_node(cache, dev, current)?;
        if let ControlFlow::Break(found) = visit(cache, current, &node)? {
            return Ok(Some(found));
        }
        current = node.next;
    }
    Ok(None)
}

/// Child of `dir` named `name`, if present.
pub fn find_child(
    cache: &mut BlockCache,
    dev: DeviceId,
    dir: &Inode,
    name: &[u8],
) -> Result<Option<Inode>> {
    trace!(dev = %dev, dir = dir.self_block.0, name = %String::from_utf8_lossy(name), "dir_lookup");
    visit_chain(cache, dev, dir.next, |cache, _, node| {
        for (_, child) in node.occupied() {
            let inode = read_inode(cache, dev, child)?;
            if inode.name.as_bytes() == name {
                return Ok(ControlFlow::Break(inode));
            }
        }
        Ok(ControlFlow::Continue(()))
    })
}

/// Inode blocks of every child of `dir`, in chain order.
pub fn child_blocks(cache: &mut BlockCache, dev: DeviceId, dir: &Inode) -> Result<Vec<BlockNumber>> {
    let mut children = Vec::new();
    visit_chain::<()>(cache, dev, dir.next, |_, _, node| {
        children.extend(node.occupied().map(|(_, child)| child));
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(children)
}

pub fn is_empty(cache: &mut BlockCache, dev: DeviceId, dir: &Inode) -> Result<bool> {
    let occupied = visit_chain(cache, dev, dir.next, |_, _, node| {
        Ok(if node.is_empty() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        })
    })?;
    Ok(occupied.is_none())
}

/// Record `child` in the first free slot of `dir`'s chain, appending a fresh
/// node if every slot is taken. `dir` is rewritten if its chain head changes.
pub fn insert_child(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    dir: &mut Inode,
    child: BlockNumber,
) -> Result<()> {
    let mut tail = None;
    let placed = visit_chain(cache, dev, dir.next, |cache, block, node| {
        if let Some(slot) = node.first_free() {
            let mut node = node.clone();
            node.slots[slot] = child;
            write_node(cache, dev, block, &node)?;
            return Ok(ControlFlow::Break(block));
        }
        tail = Some(block);
        Ok(ControlFlow::Continue(()))
    })?;
    if let Some(node_block) = placed {
        trace!(dev = %dev, dir = dir.self_block.0, child = child.0, node = node_block.0, "dir_insert");
        return Ok(());
    }

    let fresh = allocate_zeroed(cache, alloc, dev)?;
    let mut node = BlockMapNode::empty();
    node.slots[0] = child;
    write_node(cache, dev, fresh, &node)?;
    match tail {
        None => {
            dir.next = fresh;
            write_inode(cache, dev, dir)?;
        }
        Some(tail) => {
            let mut last = read_node(cache, dev, tail)?;
            last.next = fresh;
            write_node(cache, dev, tail, &last)?;
        }
    }
    debug!(dev = %dev, dir = dir.self_block.0, child = child.0, node = fresh.0, "dir_chain_extend");
    Ok(())
}

/// Clear the slot holding `child`. A node left without entries is unlinked
/// and released. A missing entry means the graph is corrupt.
pub fn remove_child(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    dir: &mut Inode,
    child: BlockNumber,
) -> Result<()> {
    let mut prev = None;
    let found = visit_chain(cache, dev, dir.next, |_, block, node| {
        if let Some(slot) = node.position(child) {
            return Ok(ControlFlow::Break((prev, block, slot, node.clone())));
        }
        prev = Some(block);
        Ok(ControlFlow::Continue(()))
    })?;
    let Some((prev, block, slot, mut node)) = found else {
        return Err(CfsError::inconsistent(
            dir.self_block.0,
            format!("directory chain lacks child {child}"),
        ));
    };

    node.slots[slot] = BlockNumber::NULL;
    if !node.is_empty() {
        return write_node(cache, dev, block, &node);
    }

    match prev {
        None => {
            dir.next = node.next;
            write_inode(cache, dev, dir)?;
        }
        Some(prev) => {
            let mut before = read_node(cache, dev, prev)?;
            before.next = node.next;
            write_node(cache, dev, prev, &before)?;
        }
    }
    release_data_block(cache, alloc, dev, block)?;
    debug!(dev = %dev, dir = dir.self_block.0, node = block.0, "dir_chain_collapse");
    Ok(())
}

/// Release every node of the chain at `head`. With `release_slots`, the
/// blocks named by filled slots (file data) are released too.
pub fn free_chain(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    head: BlockNumber,
    release_slots: bool,
) -> Result<()> {
    let limit = cache.block_count(dev)?;
    let mut current = head;
    let mut hops = 0_u32;
    while !current.is_null() {
        hops += 1;
        if hops > limit {
            return Err(CfsError::inconsistent(
                head.0,
                "block-map chain does not terminate",
            ));
        }
        let node = read_node(cache, dev, current)?;
        if release_slots {
            for (_, block) in node.occupied() {
                release_data_block(cache, alloc, dev, block)?;
            }
        }
        release_data_block(cache, alloc, dev, current)?;
        current = node.next;
    }
    Ok(())
}
