//! Open-file handles.

use cfs_inode::AccessMode;
use cfs_types::{BlockNumber, DeviceId};
use serde::{Deserialize, Serialize};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Create the file when it does not exist.
    pub create: bool,
    /// Every write lands at the current end of file.
    pub append: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Write access, creating the file if needed.
    #[must_use]
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            append: false,
        }
    }

    #[must_use]
    pub fn append() -> Self {
        Self {
            write: true,
            create: true,
            append: true,
            ..Self::default()
        }
    }

    pub(crate) fn access_mode(self) -> AccessMode {
        match (self.read, self.write) {
            (true, true) => AccessMode::ReadWrite,
            (false, true) => AccessMode::Write,
            _ => AccessMode::Read,
        }
    }
}

/// Process-local state of an open file: which inode, where the next
/// transfer starts, and what the opener may do.
///
/// The inode itself is re-read on every transfer, so several handles on one
/// file observe each other's writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub(crate) dev: DeviceId,
    pub(crate) ino: BlockNumber,
    pub(crate) pos: u64,
    pub(crate) flags: OpenFlags,
}

impl OpenFile {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.dev
    }

    #[must_use]
    pub fn ino(&self) -> BlockNumber {
        self.ino
    }

    /// Offset of the next read or write.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }
}
