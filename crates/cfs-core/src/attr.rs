//! Serializable views returned by `stat` and `statfs`.

use cfs_ondisk::{Inode, InodeKind, MasterRecord};
use cfs_types::{BLOCK_SIZE, BlockNumber, Permissions};
use serde::{Deserialize, Serialize};

/// Inode attributes, analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode-table block; doubles as the inode number.
    pub ino: BlockNumber,
    pub kind: InodeKind,
    pub perm: Permissions,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// Hardlinks pointing at this file.
    pub refcount: u32,
    pub parent: BlockNumber,
    pub name: String,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl From<&Inode> for InodeAttr {
    fn from(inode: &Inode) -> Self {
        Self {
            ino: inode.self_block,
            kind: inode.kind,
            perm: inode.perm,
            size: inode.size,
            uid: inode.owner,
            gid: inode.group,
            refcount: inode.refcount,
            parent: inode.parent,
            name: inode.name.to_string_lossy(),
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }
}

/// Capacity summary taken from the master record counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u32,
    pub inodes: u32,
    pub free_inodes: u32,
    pub data_blocks: u32,
    pub free_blocks: u32,
}

impl From<&MasterRecord> for FsStats {
    fn from(master: &MasterRecord) -> Self {
        Self {
            block_size: BLOCK_SIZE as u32,
            total_blocks: master.total_blocks,
            inodes: master.inode_table.len(),
            free_inodes: master.free_inodes,
            data_blocks: master.data.len(),
            free_blocks: master.free_blocks,
        }
    }
}
