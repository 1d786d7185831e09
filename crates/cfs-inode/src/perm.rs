//! Permission model: nine `rwx` bits checked against an explicit access mode.

use cfs_ondisk::Inode;
use serde::{Deserialize, Serialize};

const R: u8 = 0o4;
const W: u8 = 0o2;
const X: u8 = 0o1;

/// Access requested by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
    ReadWrite,
    ReadExecute,
    WriteExecute,
    ReadWriteExecute,
    /// Skip the check entirely. Used for internal walks.
    Bypass,
}

impl AccessMode {
    /// Required `rwx` triple, or `None` for [`AccessMode::Bypass`].
    #[must_use]
    pub fn bits(self) -> Option<u8> {
        match self {
            Self::Read => Some(R),
            Self::Write => Some(W),
            Self::Execute => Some(X),
            Self::ReadWrite => Some(R | W),
            Self::ReadExecute => Some(R | X),
            Self::WriteExecute => Some(W | X),
            Self::ReadWriteExecute => Some(R | W | X),
            Self::Bypass => None,
        }
    }
}

/// Identity a filesystem acts on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    /// Bits cleared from the permissions of every new inode.
    pub umask: u16,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            umask: 0o022,
        }
    }
}

/// Owner bits are tried first, then group, then world; the first class that
/// grants every requested bit wins.
#[must_use]
pub fn permits(inode: &Inode, creds: &Credentials, mode: AccessMode) -> bool {
    let Some(wanted) = mode.bits() else {
        return true;
    };
    let grants = |triple: u8| triple & wanted == wanted;
    (inode.owner == creds.uid && grants(inode.perm.user()))
        || (inode.group == creds.gid && grants(inode.perm.group()))
        || grants(inode.perm.world())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_ondisk::{InodeKind, InodeName};
    use cfs_types::{BlockNumber, Permissions};

    fn file(perm: u16, owner: u32, group: u32) -> Inode {
        Inode::new(
            InodeKind::File,
            BlockNumber(9),
            BlockNumber(8),
            InodeName::new(b"f").unwrap(),
            Permissions::from_bits(perm),
            owner,
            group,
            0,
        )
    }

    fn creds(uid: u32, gid: u32) -> Credentials {
        Credentials {
            uid,
            gid,
            umask: 0,
        }
    }

    #[test]
    fn owner_group_world_order() {
        let inode = file(0o640, 1000, 50);
        assert!(permits(&inode, &creds(1000, 1), AccessMode::ReadWrite));
        assert!(permits(&inode, &creds(7, 50), AccessMode::Read));
        assert!(!permits(&inode, &creds(7, 50), AccessMode::Write));
        assert!(!permits(&inode, &creds(7, 7), AccessMode::Read));
        assert!(permits(&inode, &creds(7, 7), AccessMode::Bypass));
    }

    #[test]
    fn any_granting_class_short_circuits() {
        // Owner has nothing, world has everything.
        let inode = file(0o007, 1000, 50);
        assert!(permits(&inode, &creds(1000, 50), AccessMode::ReadWriteExecute));
        let inode = file(0o100, 1000, 50);
        assert!(permits(&inode, &creds(1000, 50), AccessMode::Execute));
        assert!(!permits(&inode, &creds(1000, 50), AccessMode::ReadExecute));
    }

    #[test]
    fn mode_bits_cover_combinations() {
        assert_eq!(AccessMode::WriteExecute.bits(), Some(0o3));
        assert_eq!(AccessMode::ReadExecute.bits(), Some(0o5));
        assert_eq!(AccessMode::Bypass.bits(), None);
        let json = serde_json::to_string(&Credentials::default()).unwrap();
        assert_eq!(json, r#"{"uid":0,"gid":0,"umask":18}"#);
    }
}
