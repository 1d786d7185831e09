//! POSIX-shaped operations over the engine.
//!
//! Paths are resolved from the root directory; a relative path is taken as
//! relative to `/`. Creating or removing a name needs write permission on
//! the directory that holds it.

use crate::{Filesystem, FsStats, InodeAttr, OpenFile, OpenFlags};
use cfs_dir::{read_inode, unix_now};
use cfs_error::{CfsError, Result};
use cfs_file::{read_at, write_at};
use cfs_inode::AccessMode;
use cfs_ondisk::InodeKind;
use cfs_path::{normalize, split_last};
use cfs_types::{BlockNumber, DeviceId, Permissions};
use std::io::SeekFrom;
use tracing::{debug, trace};

const FROM_ROOT: BlockNumber = BlockNumber::NULL;

/// Permissions requested for files created through [`Filesystem::open`].
const DEFAULT_FILE_PERM: Permissions = Permissions::from_bits(0o666);

impl Filesystem {
    fn check_parent_writable(&mut self, dev: DeviceId, path: &str) -> Result<()> {
        let abs = normalize(path);
        if let Some((parent, _)) = split_last(&abs) {
            self.engine(dev)
                .get(FROM_ROOT, parent, true, AccessMode::Write)?;
        }
        Ok(())
    }

    fn create_kind(
        &mut self,
        dev: DeviceId,
        path: &str,
        kind: InodeKind,
        perm: Permissions,
        target: Option<&str>,
    ) -> Result<InodeAttr> {
        self.check_parent_writable(dev, path)?;
        let inode = self
            .engine(dev)
            .create(FROM_ROOT, path, kind, perm, target)?;
        Ok(InodeAttr::from(&inode))
    }

    // ── Namespace ───────────────────────────────────────────────────────────

    pub fn mkdir(&mut self, dev: DeviceId, path: &str, perm: Permissions) -> Result<InodeAttr> {
        self.create_kind(dev, path, InodeKind::Directory, perm, None)
    }

    pub fn create(&mut self, dev: DeviceId, path: &str, perm: Permissions) -> Result<InodeAttr> {
        self.create_kind(dev, path, InodeKind::File, perm, None)
    }

    /// Create `link_path` as a symlink holding `target` verbatim.
    pub fn symlink(&mut self, dev: DeviceId, target: &str, link_path: &str) -> Result<InodeAttr> {
        self.create_kind(dev, link_path, InodeKind::Symlink, Permissions::ALL, Some(target))
    }

    /// Create `new_path` as a hardlink to the plain file `existing`.
    pub fn link(&mut self, dev: DeviceId, existing: &str, new_path: &str) -> Result<InodeAttr> {
        self.create_kind(dev, new_path, InodeKind::Hardlink, Permissions::ALL, Some(existing))
    }

    pub fn readlink(&mut self, dev: DeviceId, path: &str) -> Result<String> {
        self.engine(dev).read_link_target(FROM_ROOT, path)
    }

    pub fn rmdir(&mut self, dev: DeviceId, path: &str) -> Result<()> {
        let inode = self
            .engine(dev)
            .get(FROM_ROOT, path, false, AccessMode::Bypass)?;
        if !inode.is_dir() {
            return Err(CfsError::NotDirectory);
        }
        self.check_parent_writable(dev, path)?;
        self.engine(dev).free(FROM_ROOT, path, None)
    }

    /// Remove a file, symlink, or hardlink. Symlinks are removed, not
    /// followed.
    pub fn unlink(&mut self, dev: DeviceId, path: &str) -> Result<()> {
        let inode = self
            .engine(dev)
            .get(FROM_ROOT, path, false, AccessMode::Bypass)?;
        if inode.is_dir() {
            return Err(CfsError::IsDirectory);
        }
        self.check_parent_writable(dev, path)?;
        self.engine(dev).free(FROM_ROOT, path, None)
    }

    /// Move `from` to `to` by creating `to` and transplanting `from`'s
    /// content into it. `to` must not exist.
    pub fn rename(&mut self, dev: DeviceId, from: &str, to: &str) -> Result<()> {
        if to.is_empty() {
            return Err(CfsError::Param("empty path".to_owned()));
        }
        let source = self
            .engine(dev)
            .get(FROM_ROOT, from, false, AccessMode::Bypass)?;
        if source.is_root() {
            return Err(CfsError::Param("cannot rename the root".to_owned()));
        }
        let (from_abs, to_abs) = (normalize(from), normalize(to));
        if from_abs == to_abs {
            return Ok(());
        }
        // Hardlinks name their target by path; moving it would strand them.
        if source.is_file() && source.refcount > 0 {
            return Err(CfsError::Busy(format!(
                "{from_abs} is referenced by {} hardlinks",
                source.refcount
            )));
        }
        self.check_parent_writable(dev, from)?;
        self.check_parent_writable(dev, to)?;

        if source.is_dir() {
            let Some((to_parent, _)) = split_last(&to_abs) else {
                return Err(CfsError::Exists);
            };
            let dest_parent = self
                .engine(dev)
                .get(FROM_ROOT, to_parent, true, AccessMode::Bypass)?;
            if self.is_ancestor(dev, source.self_block, dest_parent.self_block)? {
                return Err(CfsError::Param(format!(
                    "cannot move {from_abs} inside itself"
                )));
            }
            if let Some(file) = self.engine(dev).pinned_file(&source)? {
                return Err(CfsError::Busy(format!(
                    "{from_abs} holds {}, which is referenced by {} hardlinks",
                    file.name.to_string_lossy(),
                    file.refcount
                )));
            }
        }

        let placeholder = if source.is_dir() {
            InodeKind::Directory
        } else {
            InodeKind::File
        };
        let mut dest = self
            .engine(dev)
            .create(FROM_ROOT, to, placeholder, source.perm, None)?;
        self.engine(dev).free(FROM_ROOT, from, Some(&mut dest))?;
        debug!(
            dev = %dev,
            from = from_abs.as_str(),
            to = to_abs.as_str(),
            ino = dest.self_block.0,
            "rename"
        );
        Ok(())
    }

    /// Whether `ancestor` is `block` or one of its parents.
    fn is_ancestor(
        &mut self,
        dev: DeviceId,
        ancestor: BlockNumber,
        block: BlockNumber,
    ) -> Result<bool> {
        let limit = self.cache.block_count(dev)?;
        let mut current = block;
        for _ in 0..limit {
            if current == ancestor {
                return Ok(true);
            }
            let inode = read_inode(&mut self.cache, dev, current)?;
            if inode.is_root() {
                return Ok(false);
            }
            current = inode.parent;
        }
        Err(CfsError::inconsistent(
            block.0,
            "parent chain never reaches the root",
        ))
    }

    // ── Attributes ──────────────────────────────────────────────────────────

    /// Attributes of `path`, following a final link.
    pub fn stat(&mut self, dev: DeviceId, path: &str) -> Result<InodeAttr> {
        let inode = self
            .engine(dev)
            .get(FROM_ROOT, path, true, AccessMode::Bypass)?;
        Ok(InodeAttr::from(&inode))
    }

    /// Attributes of `path` itself, even when it is a link.
    pub fn lstat(&mut self, dev: DeviceId, path: &str) -> Result<InodeAttr> {
        let inode = self
            .engine(dev)
            .get(FROM_ROOT, path, false, AccessMode::Bypass)?;
        Ok(InodeAttr::from(&inode))
    }

    /// Replace the permission bits. Only the owner or uid 0 may do this.
    pub fn chmod(&mut self, dev: DeviceId, path: &str, perm: Permissions) -> Result<()> {
        let creds = self.creds;
        let mut engine = self.engine(dev);
        let mut inode = engine.get(FROM_ROOT, path, true, AccessMode::Bypass)?;
        if creds.uid != 0 && creds.uid != inode.owner {
            return Err(CfsError::PermissionDenied);
        }
        inode.perm = perm;
        inode.ctime = unix_now();
        engine.store(&inode)
    }

    /// Change ownership. Only uid 0 may do this.
    pub fn chown(&mut self, dev: DeviceId, path: &str, uid: u32, gid: u32) -> Result<()> {
        if self.creds.uid != 0 {
            return Err(CfsError::PermissionDenied);
        }
        let mut engine = self.engine(dev);
        let mut inode = engine.get(FROM_ROOT, path, true, AccessMode::Bypass)?;
        inode.owner = uid;
        inode.group = gid;
        inode.ctime = unix_now();
        engine.store(&inode)
    }

    // ── File handles ────────────────────────────────────────────────────────

    pub fn open(&mut self, dev: DeviceId, path: &str, flags: OpenFlags) -> Result<OpenFile> {
        if !flags.read && !flags.write {
            return Err(CfsError::Param("open needs read or write access".to_owned()));
        }
        let found = self
            .engine(dev)
            .get(FROM_ROOT, path, true, flags.access_mode());
        let inode = match found {
            Ok(inode) => inode,
            Err(CfsError::NotFound(_)) if flags.create => {
                self.check_parent_writable(dev, path)?;
                self.engine(dev).create(
                    FROM_ROOT,
                    path,
                    InodeKind::File,
                    DEFAULT_FILE_PERM,
                    None,
                )?
            }
            Err(err) => return Err(err),
        };
        if inode.is_dir() {
            return Err(CfsError::IsDirectory);
        }
        trace!(dev = %dev, path, ino = inode.self_block.0, ?flags, "open");
        Ok(OpenFile {
            dev,
            ino: inode.self_block,
            pos: 0,
            flags,
        })
    }

    /// Read from the handle's position, stopping at the end of the file.
    pub fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        if !file.flags.read {
            return Err(CfsError::Param("file not open for reading".to_owned()));
        }
        let mut inode = read_inode(&mut self.cache, file.dev, file.ino)?;
        if file.pos >= inode.size {
            return Ok(0);
        }
        let available = inode.size - file.pos;
        let len = usize::try_from(available).map_or(buf.len(), |avail| avail.min(buf.len()));
        let done = read_at(
            &mut self.cache,
            &mut self.alloc,
            file.dev,
            &mut inode,
            file.pos,
            &mut buf[..len],
        )?;
        file.pos += done as u64;
        Ok(done)
    }

    pub fn write(&mut self, file: &mut OpenFile, data: &[u8]) -> Result<usize> {
        if !file.flags.write {
            return Err(CfsError::Param("file not open for writing".to_owned()));
        }
        let mut inode = read_inode(&mut self.cache, file.dev, file.ino)?;
        if file.flags.append {
            file.pos = inode.size;
        }
        let done = write_at(
            &mut self.cache,
            &mut self.alloc,
            file.dev,
            &mut inode,
            file.pos,
            data,
        )?;
        file.pos += done as u64;
        Ok(done)
    }

    /// Move the handle's position. Seeking past the end is allowed; a write
    /// there leaves a hole.
    pub fn seek(&mut self, file: &mut OpenFile, to: SeekFrom) -> Result<u64> {
        let target = match to {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => file.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = read_inode(&mut self.cache, file.dev, file.ino)?.size;
                size.checked_add_signed(delta)
            }
        };
        file.pos = target
            .ok_or_else(|| CfsError::Param("seek before the start of the file".to_owned()))?;
        Ok(file.pos)
    }

    /// Release a handle. Data already sits in the cache; nothing is flushed.
    pub fn close(&mut self, file: OpenFile) -> Result<()> {
        trace!(dev = %file.dev, ino = file.ino.0, pos = file.pos, "close");
        Ok(())
    }

    // ── Device-wide ─────────────────────────────────────────────────────────

    /// Flush every dirty cached block of `dev`.
    pub fn sync(&mut self, dev: DeviceId) -> Result<()> {
        self.cache.sync(dev)
    }

    pub fn statfs(&self, dev: DeviceId) -> Result<FsStats> {
        Ok(FsStats::from(self.alloc.master(dev)?))
    }
}
