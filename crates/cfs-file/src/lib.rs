#![forbid(unsafe_code)]
//! Block-mapped file I/O.
//!
//! A file's `next` field heads a chain of block-map nodes; slot `i` of node
//! `n` holds logical block `n * 127 + i`. Empty slots and missing nodes are
//! holes and read as zeros. Writes allocate zeroed nodes and data blocks on
//! demand, so seeking far past the end and writing produces a sparse file.
//!
//! The inode carries a cursor: the byte position where the last transfer
//! ended, the node holding that position's slot, the slot index, and the
//! data block in it. A transfer that starts exactly at the cursor resumes
//! from that node instead of walking the chain from its head.

use cfs_alloc::SpaceAllocator;
use cfs_block::BlockCache;
use cfs_dir::{allocate_zeroed, read_node, unix_now, write_inode, write_node};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{BlockMapNode, FileCursor, Inode, InodeKind};
use cfs_types::{BLOCK_SIZE, BlockNumber, DeviceId, SLOTS_PER_NODE};
use tracing::{debug, trace};

const BLOCK: u64 = BLOCK_SIZE as u64;
const SLOTS: u32 = SLOTS_PER_NODE as u32;

/// Direction and buffer of one transfer.
#[derive(Debug)]
pub enum Transfer<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

impl Transfer<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

/// Position inside a file's block-map chain.
struct Walk {
    /// Index of the node within the chain.
    index: u32,
    /// Node block, or NULL once a read has run past the last node.
    block: BlockNumber,
    node: BlockMapNode,
}

impl Walk {
    fn at(cache: &mut BlockCache, dev: DeviceId, index: u32, block: BlockNumber) -> Result<Self> {
        Ok(Self {
            index,
            block,
            node: read_node(cache, dev, block)?,
        })
    }

    fn absent(index: u32) -> Self {
        Self {
            index,
            block: BlockNumber::NULL,
            node: BlockMapNode::empty(),
        }
    }

    /// Step to the following node, appending one when `grow` is set.
    fn advance(
        &mut self,
        cache: &mut BlockCache,
        alloc: &mut SpaceAllocator,
        dev: DeviceId,
        grow: bool,
    ) -> Result<()> {
        if self.block.is_null() {
            self.index += 1;
            return Ok(());
        }
        let mut next = self.node.next;
        if next.is_null() && grow {
            next = allocate_zeroed(cache, alloc, dev)?;
            self.node.next = next;
            write_node(cache, dev, self.block, &self.node)?;
            debug!(dev = %dev, node = next.0, index = self.index + 1, "file_chain_extend");
        }
        *self = if next.is_null() {
            Self::absent(self.index + 1)
        } else {
            Self::at(cache, dev, self.index + 1, next)?
        };
        Ok(())
    }
}

/// Pick the starting node for a transfer at `pos`: the chain head of a fresh
/// file, the cursor's node for a sequential continuation, or the head for a
/// cold walk.
fn start(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    inode: &mut Inode,
    pos: u64,
    first_block: u32,
    grow: bool,
) -> Result<Walk> {
    if inode.next.is_null() {
        if !grow {
            trace!(dev = %dev, inode = inode.self_block.0, "file_read_fresh");
            return Ok(Walk::absent(0));
        }
        let head = allocate_zeroed(cache, alloc, dev)?;
        inode.next = head;
        write_inode(cache, dev, inode)?;
        debug!(dev = %dev, inode = inode.self_block.0, node = head.0, "file_chain_start");
        return Ok(Walk {
            index: 0,
            block: head,
            node: BlockMapNode::empty(),
        });
    }

    let cursor = inode.cursor;
    if cursor.is_valid() && cursor.pos == pos && cursor.iblock == first_block % SLOTS {
        trace!(dev = %dev, inode = inode.self_block.0, pos, "file_seek_sequential");
        return Walk::at(cache, dev, first_block / SLOTS, cursor.current_parent);
    }

    trace!(dev = %dev, inode = inode.self_block.0, pos, "file_seek_cold");
    Walk::at(cache, dev, 0, inode.next)
}

fn logical_block(offset: u64) -> Result<u32> {
    u32::try_from(offset / BLOCK)
        .map_err(|_| CfsError::Param(format!("offset {offset} beyond addressable range")))
}

/// Transfer bytes between `transfer` and the file `inode` starting at byte
/// `pos`, returning the count processed.
///
/// Reads past the end of the file or through holes yield zeros. Writes
/// extend `size` when they end past it. The inode's cursor, size, and
/// timestamps are persisted afterwards. On failure, blocks already written
/// and allocated stay in place and the inode keeps its previous size.
#[expect(clippy::cast_possible_truncation)]
pub fn read_write(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    inode: &mut Inode,
    pos: u64,
    mut transfer: Transfer<'_>,
) -> Result<usize> {
    let len = transfer.len();
    if len == 0 {
        return Ok(0);
    }
    match inode.kind {
        InodeKind::File => {}
        InodeKind::Directory => return Err(CfsError::IsDirectory),
        InodeKind::Symlink | InodeKind::Hardlink => {
            return Err(CfsError::Param(format!(
                "inode {} is a link, not a file",
                inode.self_block
            )));
        }
    }
    let end = pos
        .checked_add(len as u64)
        .ok_or_else(|| CfsError::Param("transfer end overflows".to_owned()))?;
    let first_block = logical_block(pos)?;
    let end_block = logical_block(end)?;
    let grow = transfer.is_write();
    let size = inode.size;

    let mut walk = start(cache, alloc, dev, inode, pos, first_block, grow)?;
    let mut block = [0_u8; BLOCK_SIZE];
    let mut done = 0_usize;
    while done < len {
        let at = pos + done as u64;
        let lblock = logical_block(at)?;
        let offset = (at % BLOCK) as usize;
        let chunk = (BLOCK_SIZE - offset).min(len - done);
        while walk.index < lblock / SLOTS {
            walk.advance(cache, alloc, dev, grow)?;
        }
        let slot = (lblock % SLOTS) as usize;
        let mut data = walk.node.slots[slot];

        match &mut transfer {
            Transfer::Read(buf) => {
                let out = &mut buf[done..done + chunk];
                let valid = size.saturating_sub(at).min(chunk as u64) as usize;
                if valid > 0 && !data.is_null() {
                    cache.read(dev, data, &mut block)?;
                    out[..valid].copy_from_slice(&block[offset..offset + valid]);
                    out[valid..].fill(0);
                } else {
                    out.fill(0);
                }
            }
            Transfer::Write(src) => {
                if data.is_null() {
                    data = allocate_zeroed(cache, alloc, dev)?;
                    walk.node.slots[slot] = data;
                    write_node(cache, dev, walk.block, &walk.node)?;
                    trace!(dev = %dev, lblock, block = data.0, "file_block_alloc");
                }
                if chunk < BLOCK_SIZE {
                    cache.read(dev, data, &mut block)?;
                }
                block[offset..offset + chunk].copy_from_slice(&src[done..done + chunk]);
                cache.write(dev, data, &block)?;
            }
        }
        done += chunk;
    }

    // Leave the cursor on the node that holds the block at `end`, when the
    // chain reaches that far.
    while walk.index < end_block / SLOTS {
        walk.advance(cache, alloc, dev, false)?;
    }
    let end_slot = end_block % SLOTS;
    inode.cursor = FileCursor {
        pos: end,
        current: walk.node.slots[end_slot as usize],
        current_parent: walk.block,
        iblock: end_slot,
    };
    let now = unix_now();
    if grow {
        inode.size = inode.size.max(end);
        inode.mtime = now;
        inode.ctime = now;
    } else {
        inode.atime = now;
    }
    write_inode(cache, dev, inode)?;
    debug!(
        dev = %dev,
        inode = inode.self_block.0,
        pos,
        len,
        write = grow,
        size = inode.size,
        "file_transfer"
    );
    Ok(len)
}

pub fn read_at(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    inode: &mut Inode,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize> {
    read_write(cache, alloc, dev, inode, pos, Transfer::Read(buf))
}

pub fn write_at(
    cache: &mut BlockCache,
    alloc: &mut SpaceAllocator,
    dev: DeviceId,
    inode: &mut Inode,
    pos: u64,
    data: &[u8],
) -> Result<usize> {
    read_write(cache, alloc, dev, inode, pos, Transfer::Write(data))
}
