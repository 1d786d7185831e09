//! Inode records. One inode occupies one inode-table block and is
//! identified by that block number.

use cfs_types::{
    BLOCK_SIZE, BlockBuf, BlockNumber, NAME_MAX, ParseError, Permissions, ensure_slice,
    read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const OFF_PERM: usize = 0;
const OFF_KIND: usize = 2;
const OFF_SELF: usize = 4;
const OFF_PARENT: usize = 8;
const OFF_NEXT: usize = 12;
const OFF_SIZE: usize = 16;
const OFF_OWNER: usize = 24;
const OFF_GROUP: usize = 28;
const OFF_REFCOUNT: usize = 32;
const OFF_IBLOCK: usize = 36;
const OFF_POS: usize = 40;
const OFF_CURRENT: usize = 48;
const OFF_CURRENT_PARENT: usize = 52;
const OFF_ATIME: usize = 56;
const OFF_MTIME: usize = 64;
const OFF_CTIME: usize = 72;
const OFF_NAME_LEN: usize = 80;
const OFF_NAME: usize = 81;

/// Type tag. The four kinds are mutually exclusive; tag 0 marks a free slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    Directory = 1,
    File = 2,
    Symlink = 3,
    Hardlink = 4,
}

impl InodeKind {
    fn from_tag(tag: u8) -> Result<Option<Self>, ParseError> {
        match tag {
            0 => Ok(None),
            1 => Ok(Some(Self::Directory)),
            2 => Ok(Some(Self::File)),
            3 => Ok(Some(Self::Symlink)),
            4 => Ok(Some(Self::Hardlink)),
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown inode type tag",
            }),
        }
    }

    /// Symlinks and hardlinks both store a target path in their chain head.
    #[must_use]
    pub fn is_link(self) -> bool {
        matches!(self, Self::Symlink | Self::Hardlink)
    }
}

/// Fixed-capacity component name stored inside the inode.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InodeName {
    len: u8,
    bytes: [u8; NAME_MAX],
}

impl InodeName {
    /// The root's name.
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; NAME_MAX],
    };

    /// Build a name, rejecting separators and names over `NAME_MAX` bytes.
    pub fn new(name: &[u8]) -> Result<Self, ParseError> {
        if name.len() > NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than NAME_MAX",
            });
        }
        if name.contains(&b'/') || name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "contains '/' or NUL",
            });
        }
        let len = u8::try_from(name.len()).map_err(|_| ParseError::InvalidField {
            field: "name",
            reason: "longer than NAME_MAX",
        })?;
        let mut bytes = [0_u8; NAME_MAX];
        bytes[..name.len()].copy_from_slice(name);
        Ok(Self { len, bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl fmt::Debug for InodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// Resumable I/O bookmark of an open file.
///
/// `current_parent` is the block-map node holding the block at `pos`,
/// `iblock` the slot inside that node, `current` the data block in the slot.
/// A null `current_parent` means "no bookmark".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileCursor {
    pub pos: u64,
    pub current: BlockNumber,
    pub current_parent: BlockNumber,
    pub iblock: u32,
}

impl FileCursor {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.current_parent.is_null()
    }
}

/// Decoded inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub perm: Permissions,
    pub kind: InodeKind,
    /// Inode-table block holding this inode. Never changes after creation.
    pub self_block: BlockNumber,
    /// Containing directory; the root is its own parent.
    pub parent: BlockNumber,
    /// Head of the block-map chain (entries, data, or link record).
    pub next: BlockNumber,
    pub size: u64,
    pub owner: u32,
    pub group: u32,
    /// Number of hardlinks pointing at this file.
    pub refcount: u32,
    pub cursor: FileCursor,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub name: InodeName,
}

impl Inode {
    /// A fresh inode with an empty chain and all timestamps set to `now`.
    #[must_use]
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        kind: InodeKind,
        self_block: BlockNumber,
        parent: BlockNumber,
        name: InodeName,
        perm: Permissions,
        owner: u32,
        group: u32,
        now: u64,
    ) -> Self {
        Self {
            perm,
            kind,
            self_block,
            parent,
            next: BlockNumber::NULL,
            size: 0,
            owner,
            group,
            refcount: 0,
            cursor: FileCursor::default(),
            atime: now,
            mtime: now,
            ctime: now,
            name,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent == self.self_block
    }

    /// Decode an inode-table block. `Ok(None)` for a free (all-zero tag) slot.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Option<Self>, ParseError> {
        let tag = ensure_slice(bytes, OFF_KIND, 1)?[0];
        let Some(kind) = InodeKind::from_tag(tag)? else {
            return Ok(None);
        };

        let name_len = usize::from(ensure_slice(bytes, OFF_NAME_LEN, 1)?[0]);
        if name_len > NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "longer than NAME_MAX",
            });
        }
        let name = InodeName::new(ensure_slice(bytes, OFF_NAME, name_len)?)?;

        Ok(Some(Self {
            perm: Permissions::from_bits(read_le_u16(bytes, OFF_PERM)?),
            kind,
            self_block: BlockNumber(read_le_u32(bytes, OFF_SELF)?),
            parent: BlockNumber(read_le_u32(bytes, OFF_PARENT)?),
            next: BlockNumber(read_le_u32(bytes, OFF_NEXT)?),
            size: read_le_u64(bytes, OFF_SIZE)?,
            owner: read_le_u32(bytes, OFF_OWNER)?,
            group: read_le_u32(bytes, OFF_GROUP)?,
            refcount: read_le_u32(bytes, OFF_REFCOUNT)?,
            cursor: FileCursor {
                pos: read_le_u64(bytes, OFF_POS)?,
                current: BlockNumber(read_le_u32(bytes, OFF_CURRENT)?),
                current_parent: BlockNumber(read_le_u32(bytes, OFF_CURRENT_PARENT)?),
                iblock: read_le_u32(bytes, OFF_IBLOCK)?,
            },
            atime: read_le_u64(bytes, OFF_ATIME)?,
            mtime: read_le_u64(bytes, OFF_MTIME)?,
            ctime: read_le_u64(bytes, OFF_CTIME)?,
            name,
        }))
    }

    /// Encode into a full inode-table block.
    #[must_use]
    pub fn to_block(&self) -> BlockBuf {
        let mut buf = [0_u8; BLOCK_SIZE];
        let written = self.write_fields(&mut buf);
        debug_assert!(written.is_ok(), "inode field offsets exceed the block");
        buf
    }

    fn write_fields(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_le_u16(buf, OFF_PERM, self.perm.bits())?;
        buf[OFF_KIND] = self.kind as u8;
        write_le_u32(buf, OFF_SELF, self.self_block.0)?;
        write_le_u32(buf, OFF_PARENT, self.parent.0)?;
        write_le_u32(buf, OFF_NEXT, self.next.0)?;
        write_le_u64(buf, OFF_SIZE, self.size)?;
        write_le_u32(buf, OFF_OWNER, self.owner)?;
        write_le_u32(buf, OFF_GROUP, self.group)?;
        write_le_u32(buf, OFF_REFCOUNT, self.refcount)?;
        write_le_u32(buf, OFF_IBLOCK, self.cursor.iblock)?;
        write_le_u64(buf, OFF_POS, self.cursor.pos)?;
        write_le_u32(buf, OFF_CURRENT, self.cursor.current.0)?;
        write_le_u32(buf, OFF_CURRENT_PARENT, self.cursor.current_parent.0)?;
        write_le_u64(buf, OFF_ATIME, self.atime)?;
        write_le_u64(buf, OFF_MTIME, self.mtime)?;
        write_le_u64(buf, OFF_CTIME, self.ctime)?;
        buf[OFF_NAME_LEN] = self.name.len;
        write_bytes(buf, OFF_NAME, self.name.as_bytes())
    }
}
