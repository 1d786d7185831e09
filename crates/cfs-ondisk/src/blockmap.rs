//! Block-map chain nodes and link records.
//!
//! A block-map node is one block holding a `next` pointer and 127 slots.
//! Directories store child inode blocks in the slots, files store data
//! blocks. Symlink and hardlink inodes point at a single link record block
//! holding the target path instead.

use cfs_types::{
    BLOCK_SIZE, BlockBuf, BlockNumber, MAX_PATH_LEN, ParseError, SLOTS_PER_NODE, ensure_slice,
    read_le_u16, read_le_u32, write_bytes, write_le_u16, write_le_u32,
};

const OFF_NEXT: usize = 0;
const OFF_SLOTS: usize = 4;
const OFF_LINK_LEN: usize = 0;
const OFF_LINK_TARGET: usize = 2;

/// One node of a block-map chain. Empty slots and end of chain are `NULL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapNode {
    pub next: BlockNumber,
    pub slots: [BlockNumber; SLOTS_PER_NODE],
}

impl Default for BlockMapNode {
    fn default() -> Self {
        Self::empty()
    }
}

impl BlockMapNode {
    /// A node with no successor and every slot empty (all-zero block).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            next: BlockNumber::NULL,
            slots: [BlockNumber::NULL; SLOTS_PER_NODE],
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, BLOCK_SIZE)?;
        let mut node = Self::empty();
        node.next = BlockNumber(read_le_u32(bytes, OFF_NEXT)?);
        for (idx, slot) in node.slots.iter_mut().enumerate() {
            *slot = BlockNumber(read_le_u32(bytes, OFF_SLOTS + idx * 4)?);
        }
        Ok(node)
    }

    #[must_use]
    pub fn to_block(&self) -> BlockBuf {
        let mut buf = [0_u8; BLOCK_SIZE];
        buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&self.next.0.to_le_bytes());
        for (idx, slot) in self.slots.iter().enumerate() {
            let at = OFF_SLOTS + idx * 4;
            buf[at..at + 4].copy_from_slice(&slot.0.to_le_bytes());
        }
        buf
    }

    /// True when no slot holds a block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_null())
    }

    #[must_use]
    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_null())
    }

    /// Slot index holding `block`, if any.
    #[must_use]
    pub fn position(&self, block: BlockNumber) -> Option<usize> {
        if block.is_null() {
            return None;
        }
        self.slots.iter().position(|slot| *slot == block)
    }

    /// Filled slots in order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, BlockNumber)> + '_ {
        self.slots
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, slot)| !slot.is_null())
    }
}

/// Target path of a symlink or hardlink, stored length-prefixed in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    target: String,
}

impl LinkRecord {
    pub fn new(target: &str) -> Result<Self, ParseError> {
        if target.is_empty() {
            return Err(ParseError::InvalidField {
                field: "link_target",
                reason: "empty",
            });
        }
        if target.len() > MAX_PATH_LEN {
            return Err(ParseError::InvalidField {
                field: "link_target",
                reason: "longer than MAX_PATH_LEN",
            });
        }
        Ok(Self {
            target: target.to_owned(),
        })
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let len = usize::from(read_le_u16(bytes, OFF_LINK_LEN)?);
        if len > MAX_PATH_LEN {
            return Err(ParseError::InvalidField {
                field: "link_len",
                reason: "longer than MAX_PATH_LEN",
            });
        }
        let raw = ensure_slice(bytes, OFF_LINK_TARGET, len)?;
        let target = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidField {
            field: "link_target",
            reason: "not valid UTF-8",
        })?;
        Self::new(target)
    }

    #[must_use]
    pub fn to_block(&self) -> BlockBuf {
        let mut buf = [0_u8; BLOCK_SIZE];
        // `new` bounds the target to MAX_PATH_LEN, which always fits.
        let written = u16::try_from(self.target.len())
            .map_err(|_| ParseError::InvalidField {
                field: "link_len",
                reason: "overflows u16",
            })
            .and_then(|len| write_le_u16(&mut buf, OFF_LINK_LEN, len))
            .and_then(|()| write_bytes(&mut buf, OFF_LINK_TARGET, self.target.as_bytes()));
        debug_assert!(written.is_ok(), "link record exceeds the block");
        buf
    }
}
