#![forbid(unsafe_code)]
//! Inode graph engine.
//!
//! Lookup walks the tree component by component from the root inode, which
//! sits in the first inode-table block and is created on first use. Symlinks
//! met along the way are expanded by re-entering the walk on their target
//! text with an explicit depth, so a cycle ends in `TooManyLinks` instead of
//! unbounded recursion.
//!
//! Creation and removal are multi-step and not atomic. A failure partway
//! through leaves whatever was already written in place.

mod perm;

pub use perm::{AccessMode, Credentials, permits};

use cfs_alloc::SpaceAllocator;
use cfs_block::BlockCache;
use cfs_dir::{
    allocate_zeroed, child_blocks, find_child, free_chain, insert_child, read_inode,
    read_inode_opt, read_link, release_data_block, remove_child, unix_now, write_inode,
    write_link,
};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{FileCursor, Inode, InodeKind, InodeName, LinkRecord};
use cfs_path::{components, inode_path, realpath, split_last};
use cfs_types::{
    BLOCK_SIZE, BlockNumber, DeviceId, MAX_LINK_DEPTH, MAX_PATH_LEN, NAME_MAX, Permissions,
};
use tracing::{debug, info, trace, warn};

/// Engine bound to one mounted device for the duration of a call sequence.
///
/// Borrows the cache and allocator from the owning context; nothing is
/// cached in the engine itself between calls.
pub struct InodeEngine<'a> {
    cache: &'a mut BlockCache,
    alloc: &'a mut SpaceAllocator,
    dev: DeviceId,
    creds: Credentials,
}

impl<'a> InodeEngine<'a> {
    pub fn new(
        cache: &'a mut BlockCache,
        alloc: &'a mut SpaceAllocator,
        dev: DeviceId,
        creds: Credentials,
    ) -> Self {
        Self {
            cache,
            alloc,
            dev,
            creds,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    // ── Root ────────────────────────────────────────────────────────────────

    /// The root directory, materialized with all permissions if its slot is
    /// still free.
    pub fn root(&mut self) -> Result<Inode> {
        let block = self.alloc.master(self.dev)?.inode_table.start;
        if let Some(root) = read_inode_opt(self.cache, self.dev, block)? {
            if !root.is_dir() || !root.is_root() {
                return Err(CfsError::inconsistent(
                    block.0,
                    "first inode-table slot is not the root directory",
                ));
            }
            return Ok(root);
        }

        self.alloc.claim_inode_block(self.cache, self.dev, block)?;
        let root = Inode::new(
            InodeKind::Directory,
            block,
            block,
            InodeName::EMPTY,
            Permissions::ALL,
            0,
            0,
            unix_now(),
        );
        write_inode(self.cache, self.dev, &root)?;
        info!(dev = %self.dev, block = block.0, "root_materialized");
        Ok(root)
    }

    fn canonical(&mut self, cwd: BlockNumber, path: &str) -> Result<String> {
        let cwd = if cwd.is_null() {
            self.root()?.self_block
        } else {
            cwd
        };
        realpath(self.cache, self.dev, cwd, path)
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Resolve `path` relative to the directory inode `cwd` (`NULL` means the
    /// root). With `follow`, a link in the final position is replaced by what
    /// it points at. The returned inode must grant `mode` to the engine's
    /// credentials.
    pub fn get(
        &mut self,
        cwd: BlockNumber,
        path: &str,
        follow: bool,
        mode: AccessMode,
    ) -> Result<Inode> {
        let abs = self.canonical(cwd, path)?;
        self.lookup(&abs, follow, mode, 0)
    }

    fn lookup(&mut self, abs: &str, follow: bool, mode: AccessMode, depth: u32) -> Result<Inode> {
        let mut current = self.root()?;
        for name in components(abs) {
            if name.len() > NAME_MAX {
                return Err(CfsError::NameTooLong);
            }
            let dir = self.as_directory(current, depth)?;
            current = find_child(self.cache, self.dev, &dir, name.as_bytes())?
                .ok_or_else(|| CfsError::NotFound(abs.to_owned()))?;
        }
        if follow && current.kind.is_link() {
            current = self.resolve_link(&current, depth)?;
        }
        if !permits(&current, &self.creds, mode) {
            trace!(dev = %self.dev, path = abs, ?mode, "access_denied");
            return Err(CfsError::PermissionDenied);
        }
        Ok(current)
    }

    /// An intermediate component must be a directory or a symlink to one.
    fn as_directory(&mut self, inode: Inode, depth: u32) -> Result<Inode> {
        match inode.kind {
            InodeKind::Directory => Ok(inode),
            InodeKind::Symlink => {
                let target = self.resolve_link(&inode, depth)?;
                if target.is_dir() {
                    Ok(target)
                } else {
                    Err(CfsError::NotDirectory)
                }
            }
            InodeKind::File | InodeKind::Hardlink => Err(CfsError::NotDirectory),
        }
    }

    /// Follow `link` to the inode its target names. Relative targets are
    /// taken from the directory holding the link.
    fn resolve_link(&mut self, link: &Inode, depth: u32) -> Result<Inode> {
        if depth >= MAX_LINK_DEPTH {
            debug!(dev = %self.dev, link = link.self_block.0, depth, "link_depth_exceeded");
            return Err(CfsError::TooManyLinks);
        }
        let record = read_link(self.cache, self.dev, link.next)?;
        let abs = realpath(self.cache, self.dev, link.parent, record.target())?;
        debug!(
            dev = %self.dev,
            link = link.self_block.0,
            target = abs.as_str(),
            depth,
            "link_resolve"
        );
        self.lookup(&abs, true, AccessMode::Bypass, depth + 1)
    }

    /// Target text stored in the symlink or hardlink at `path`.
    pub fn read_link_target(&mut self, cwd: BlockNumber, path: &str) -> Result<String> {
        let link = self.get(cwd, path, false, AccessMode::Bypass)?;
        if !link.kind.is_link() {
            return Err(CfsError::Param(format!("{path} is not a link")));
        }
        Ok(read_link(self.cache, self.dev, link.next)?.target().to_owned())
    }

    /// Inodes held by `dir`, in chain order.
    pub fn children(&mut self, dir: &Inode) -> Result<Vec<Inode>> {
        if !dir.is_dir() {
            return Err(CfsError::NotDirectory);
        }
        child_blocks(self.cache, self.dev, dir)?
            .into_iter()
            .map(|block| read_inode(self.cache, self.dev, block))
            .collect()
    }

    /// Persist attribute changes made by the caller.
    pub fn store(&mut self, inode: &Inode) -> Result<()> {
        write_inode(self.cache, self.dev, inode)
    }

    // ── Create ──────────────────────────────────────────────────────────────

    /// Create `path` as a new inode of `kind`. `perm` is reduced by the
    /// credentials' umask. Links require `link_target`; a hardlink target must
    /// be an existing plain file.
    pub fn create(
        &mut self,
        cwd: BlockNumber,
        path: &str,
        kind: InodeKind,
        perm: Permissions,
        link_target: Option<&str>,
    ) -> Result<Inode> {
        let abs = self.canonical(cwd, path)?;
        let Some((parent_path, name)) = split_last(&abs) else {
            return Err(CfsError::Exists);
        };
        if name.len() > NAME_MAX {
            return Err(CfsError::NameTooLong);
        }
        let name = InodeName::new(name.as_bytes())
            .map_err(|err| CfsError::Param(format!("bad name {name:?}: {err}")))?;

        let mut parent = self.lookup(parent_path, true, AccessMode::Bypass, 0)?;
        if !parent.is_dir() {
            return Err(CfsError::NotDirectory);
        }
        if find_child(self.cache, self.dev, &parent, name.as_bytes())?.is_some() {
            return Err(CfsError::Exists);
        }

        let link = match (kind.is_link(), link_target) {
            (true, Some(target)) => Some(self.prepare_link(kind, cwd, target)?),
            (true, None) => return Err(CfsError::Param("link target required".to_owned())),
            (false, Some(_)) => {
                return Err(CfsError::Param(
                    "link target given for a non-link inode".to_owned(),
                ));
            }
            (false, None) => None,
        };

        let now = unix_now();
        let block = self.alloc.allocate_inode_block(self.cache, self.dev)?;
        let mut inode = Inode::new(
            kind,
            block,
            parent.self_block,
            name,
            perm.masked(self.creds.umask),
            self.creds.uid,
            self.creds.gid,
            now,
        );
        if let Some((record, _)) = &link {
            let data = allocate_zeroed(self.cache, self.alloc, self.dev)?;
            write_link(self.cache, self.dev, data, record)?;
            inode.next = data;
            inode.size = record.target().len() as u64;
        }
        write_inode(self.cache, self.dev, &inode)?;

        insert_child(self.cache, self.alloc, self.dev, &mut parent, block)?;
        parent.mtime = now;
        write_inode(self.cache, self.dev, &parent)?;

        if let Some((_, Some(target))) = link {
            let mut target = read_inode(self.cache, self.dev, target)?;
            target.refcount = target.refcount.saturating_add(1);
            target.ctime = now;
            write_inode(self.cache, self.dev, &target)?;
        }
        debug!(
            dev = %self.dev,
            path = abs.as_str(),
            ?kind,
            block = block.0,
            parent = parent.self_block.0,
            "inode_create"
        );
        Ok(inode)
    }

    /// Validate a link target and build its record. Hardlinks store the
    /// physical path of their target, with every symlink already resolved,
    /// and report the target's inode block.
    fn prepare_link(
        &mut self,
        kind: InodeKind,
        cwd: BlockNumber,
        target: &str,
    ) -> Result<(LinkRecord, Option<BlockNumber>)> {
        if target.is_empty() {
            return Err(CfsError::Param("empty link target".to_owned()));
        }
        if target.len() > MAX_PATH_LEN {
            return Err(CfsError::NameTooLong);
        }
        let (text, referenced) = if kind == InodeKind::Hardlink {
            let abs = self.canonical(cwd, target)?;
            let file = self.lookup(&abs, false, AccessMode::Bypass, 0)?;
            match file.kind {
                InodeKind::File => (self.physical_path(&file)?, Some(file.self_block)),
                InodeKind::Directory => return Err(CfsError::IsDirectory),
                InodeKind::Symlink | InodeKind::Hardlink => {
                    return Err(CfsError::Param(format!(
                        "hardlink target {abs} is itself a link"
                    )));
                }
            }
        } else {
            (target.to_owned(), None)
        };
        let record = LinkRecord::new(&text)
            .map_err(|err| CfsError::Param(format!("bad link target: {err}")))?;
        Ok((record, referenced))
    }

    /// Absolute path of `inode` built from parent pointers, so it names no
    /// symlinks.
    fn physical_path(&mut self, inode: &Inode) -> Result<String> {
        let dir = inode_path(self.cache, self.dev, inode.parent)?;
        let name = inode.name.to_string_lossy();
        let path = if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        };
        if path.len() > MAX_PATH_LEN {
            return Err(CfsError::NameTooLong);
        }
        Ok(path)
    }

    /// First file under `dir` that hardlinks still reference.
    ///
    /// Hardlink records name their target by path, so such a file pins every
    /// directory above it in place.
    pub fn pinned_file(&mut self, dir: &Inode) -> Result<Option<Inode>> {
        let mut budget = self.cache.block_count(self.dev)?;
        let mut pending = vec![dir.self_block];
        while let Some(block) = pending.pop() {
            let inode = read_inode(self.cache, self.dev, block)?;
            if !inode.is_dir() {
                continue;
            }
            for child in child_blocks(self.cache, self.dev, &inode)? {
                budget = budget.checked_sub(1).ok_or_else(|| {
                    CfsError::Format(format!("directory cycle below block {}", dir.self_block.0))
                })?;
                let entry = read_inode(self.cache, self.dev, child)?;
                match entry.kind {
                    InodeKind::File if entry.refcount > 0 => return Ok(Some(entry)),
                    InodeKind::Directory => pending.push(child),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    // ── Free ────────────────────────────────────────────────────────────────

    /// Remove `path` without following a final link.
    ///
    /// Without `rename_target` the inode's storage and slot are released.
    /// With it, the removed inode's content moves into the replacement,
    /// which must not own storage yet; a directory's children are re-parented
    /// onto it.
    pub fn free(
        &mut self,
        cwd: BlockNumber,
        path: &str,
        rename_target: Option<&mut Inode>,
    ) -> Result<()> {
        let abs = self.canonical(cwd, path)?;
        if split_last(&abs).is_none() {
            return Err(CfsError::Param("cannot free the root".to_owned()));
        }
        let victim = self.lookup(&abs, false, AccessMode::Bypass, 0)?;
        if victim.is_root() {
            return Err(CfsError::Param("cannot free the root".to_owned()));
        }
        match victim.kind {
            InodeKind::Directory
                if rename_target.is_none() && !cfs_dir::is_empty(self.cache, self.dev, &victim)? =>
            {
                return Err(CfsError::NotEmpty);
            }
            InodeKind::File if victim.refcount > 0 => {
                return Err(CfsError::Busy(format!(
                    "{abs} is referenced by {} hardlinks",
                    victim.refcount
                )));
            }
            InodeKind::Directory if rename_target.is_some() => {
                if let Some(file) = self.pinned_file(&victim)? {
                    return Err(CfsError::Busy(format!(
                        "{abs} holds {}, which is referenced by {} hardlinks",
                        file.name.to_string_lossy(),
                        file.refcount
                    )));
                }
            }
            _ => {}
        }
        if let Some(target) = rename_target.as_deref() {
            if !target.next.is_null() {
                return Err(CfsError::Param(
                    "replacement inode already owns storage".to_owned(),
                ));
            }
            if target.self_block == victim.self_block {
                return Err(CfsError::Param("cannot transplant onto itself".to_owned()));
            }
        }

        let now = unix_now();
        let mut parent = read_inode(self.cache, self.dev, victim.parent)?;
        remove_child(self.cache, self.alloc, self.dev, &mut parent, victim.self_block)?;
        parent.mtime = now;
        write_inode(self.cache, self.dev, &parent)?;

        match rename_target {
            Some(target) => self.transplant(&victim, target, now)?,
            None => self.release_storage(&victim)?,
        }

        self.cache
            .write(self.dev, victim.self_block, &[0_u8; BLOCK_SIZE])?;
        self.alloc
            .free_inode_block(self.cache, self.dev, victim.self_block)?;
        debug!(
            dev = %self.dev,
            path = abs.as_str(),
            kind = ?victim.kind,
            block = victim.self_block.0,
            "inode_free"
        );
        Ok(())
    }

    fn transplant(&mut self, victim: &Inode, target: &mut Inode, now: u64) -> Result<()> {
        target.kind = victim.kind;
        target.next = victim.next;
        target.size = victim.size;
        target.perm = victim.perm;
        target.owner = victim.owner;
        target.group = victim.group;
        target.refcount = victim.refcount;
        target.atime = victim.atime;
        target.mtime = victim.mtime;
        target.ctime = now;
        target.cursor = FileCursor::default();

        if victim.is_dir() {
            for child in child_blocks(self.cache, self.dev, victim)? {
                let mut inode = read_inode(self.cache, self.dev, child)?;
                inode.parent = target.self_block;
                write_inode(self.cache, self.dev, &inode)?;
            }
        }
        write_inode(self.cache, self.dev, target)?;
        trace!(
            dev = %self.dev,
            from = victim.self_block.0,
            to = target.self_block.0,
            "inode_transplant"
        );
        Ok(())
    }

    fn release_storage(&mut self, victim: &Inode) -> Result<()> {
        match victim.kind {
            InodeKind::File => free_chain(self.cache, self.alloc, self.dev, victim.next, true),
            InodeKind::Directory => {
                free_chain(self.cache, self.alloc, self.dev, victim.next, false)
            }
            InodeKind::Symlink => self.release_link_block(victim),
            InodeKind::Hardlink => {
                let record = read_link(self.cache, self.dev, victim.next)?;
                match self.lookup(record.target(), false, AccessMode::Bypass, 0) {
                    Ok(mut file) if file.is_file() => {
                        file.refcount = file.refcount.saturating_sub(1);
                        file.ctime = unix_now();
                        write_inode(self.cache, self.dev, &file)?;
                    }
                    Ok(_) | Err(CfsError::NotFound(_)) => {
                        warn!(
                            dev = %self.dev,
                            link = victim.self_block.0,
                            target = record.target(),
                            "hardlink_target_missing"
                        );
                    }
                    Err(err) => return Err(err),
                }
                self.release_link_block(victim)
            }
        }
    }

    fn release_link_block(&mut self, link: &Inode) -> Result<()> {
        if link.next.is_null() {
            return Ok(());
        }
        release_data_block(self.cache, self.alloc, self.dev, link.next)
    }
}
