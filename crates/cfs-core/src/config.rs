//! Option structs for formatting and mounting.

use cfs_types::DEFAULT_BLOCK_START;
use serde::{Deserialize, Serialize};

/// Options for [`Filesystem::create_fs`](crate::Filesystem::create_fs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkfsOptions {
    /// Block holding the master record. Block 0 stays reserved.
    pub block_start: u32,
    /// Blocks covered by the filesystem; the whole device when `None`.
    pub total_blocks: Option<u32>,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_start: DEFAULT_BLOCK_START,
            total_blocks: None,
        }
    }
}

/// Options for [`Filesystem::dev_open`](crate::Filesystem::dev_open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Where to look for the master record.
    pub block_start: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            block_start: DEFAULT_BLOCK_START,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_after_boot_block() {
        assert_eq!(MkfsOptions::default().block_start, 1);
        assert_eq!(MkfsOptions::default().total_blocks, None);
        assert_eq!(OpenOptions::default().block_start, 1);
    }

    #[test]
    fn options_deserialize_from_json() {
        let mkfs: MkfsOptions =
            serde_json::from_str(r#"{"block_start":4,"total_blocks":2048}"#).unwrap();
        assert_eq!(mkfs.block_start, 4);
        assert_eq!(mkfs.total_blocks, Some(2048));
        let open: OpenOptions = serde_json::from_str(r#"{"block_start":4}"#).unwrap();
        assert_eq!(open.block_start, 4);
    }
}
