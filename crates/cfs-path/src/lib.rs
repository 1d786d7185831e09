#![forbid(unsafe_code)]
//! Path canonicalization.
//!
//! [`realpath`] turns a path relative to a working-directory inode into an
//! absolute, normalized path. It never looks at symlinks; link expansion
//! belongs to the inode engine, which calls back in here with the link text.

use cfs_block::BlockCache;
use cfs_dir::read_inode;
use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, DeviceId, MAX_PATH_LEN};
use tracing::trace;

/// Resolve `.` and `..` lexically. `..` at the root stays at the root, and an
/// empty result is `/`. Relative input is treated as rooted.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Components of a normalized absolute path, root excluded.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

/// Split a normalized absolute path into its parent path and final name.
/// `None` for the root.
#[must_use]
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}

fn check_length(path: &str) -> Result<()> {
    if path.len() > MAX_PATH_LEN {
        return Err(CfsError::NameTooLong);
    }
    Ok(())
}

/// Absolute path of the directory inode at `dir`, built by walking parent
/// pointers up to the root.
pub fn inode_path(cache: &mut BlockCache, dev: DeviceId, dir: BlockNumber) -> Result<String> {
    let limit = cache.block_count(dev)?;
    let mut names: Vec<String> = Vec::new();
    let mut inode = read_inode(cache, dev, dir)?;
    let mut hops = 0_u32;
    while !inode.is_root() {
        hops += 1;
        if hops > limit {
            return Err(CfsError::inconsistent(
                dir.0,
                "parent chain never reaches the root",
            ));
        }
        names.push(inode.name.to_string_lossy());
        inode = read_inode(cache, dev, inode.parent)?;
    }
    if names.is_empty() {
        return Ok("/".to_owned());
    }
    let mut out = String::new();
    for name in names.iter().rev() {
        out.push('/');
        out.push_str(name);
    }
    check_length(&out)?;
    Ok(out)
}

/// Canonical absolute form of `path` as seen from the directory `cwd`.
pub fn realpath(
    cache: &mut BlockCache,
    dev: DeviceId,
    cwd: BlockNumber,
    path: &str,
) -> Result<String> {
    if path.is_empty() {
        return Err(CfsError::Param("empty path".to_owned()));
    }
    check_length(path)?;

    let resolved = if path.starts_with('/') {
        normalize(path)
    } else {
        let cwd_inode = read_inode(cache, dev, cwd)?;
        if !cwd_inode.is_dir() {
            return Err(CfsError::NotDirectory);
        }
        let prefix = inode_path(cache, dev, cwd)?;
        normalize(&format!("{prefix}/{path}"))
    };
    check_length(&resolved)?;
    trace!(dev = %dev, cwd = cwd.0, input = path, resolved = resolved.as_str(), "realpath");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{CacheConfig, MemBlockDevice};
    use cfs_dir::write_inode;
    use cfs_ondisk::{Inode, InodeKind, InodeName};
    use cfs_types::{NAME_MAX, Permissions};
    use proptest::prelude::*;

    const ROOT: BlockNumber = BlockNumber(10);
    const A: BlockNumber = BlockNumber(11);
    const B: BlockNumber = BlockNumber(12);
    const FILE: BlockNumber = BlockNumber(13);

    /// `/a/b` plus the file `/a/f`, written straight into inode blocks.
    fn tree() -> (BlockCache, DeviceId) {
        let mut cache = BlockCache::new(CacheConfig::default()).unwrap();
        let dev = cache
            .attach("mem", Box::new(MemBlockDevice::new(64)))
            .unwrap();
        for (block, parent, name, kind) in [
            (ROOT, ROOT, "", InodeKind::Directory),
            (A, ROOT, "a", InodeKind::Directory),
            (B, A, "b", InodeKind::Directory),
            (FILE, A, "f", InodeKind::File),
        ] {
            let inode = Inode::new(
                kind,
                block,
                parent,
                InodeName::new(name.as_bytes()).unwrap(),
                Permissions::ALL,
                0,
                0,
                0,
            );
            write_inode(&mut cache, dev, &inode).unwrap();
        }
        (cache, dev)
    }

    #[test]
    fn normalize_handles_dots() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize("//a///b/"), "/a/b");
        assert_eq!(normalize("/a/b/../../.."), "/");
        assert_eq!(normalize("/a/..b/c."), "/a/..b/c.");
    }

    #[test]
    fn split_last_separates_parent() {
        assert_eq!(split_last("/x"), Some(("/", "x")));
        assert_eq!(split_last("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(split_last("/"), None);
        assert_eq!(components("/a/b").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn realpath_relative_to_working_directory() {
        let (mut cache, dev) = tree();
        assert_eq!(realpath(&mut cache, dev, B, "../x").unwrap(), "/a/x");
        assert_eq!(realpath(&mut cache, dev, A, "./x").unwrap(), "/a/x");
        assert_eq!(realpath(&mut cache, dev, B, "/x").unwrap(), "/x");
        assert_eq!(realpath(&mut cache, dev, ROOT, "..").unwrap(), "/");
        assert_eq!(realpath(&mut cache, dev, B, ".").unwrap(), "/a/b");
        assert_eq!(inode_path(&mut cache, dev, B).unwrap(), "/a/b");
    }

    #[test]
    fn realpath_rejects_bad_input() {
        let (mut cache, dev) = tree();
        assert!(matches!(
            realpath(&mut cache, dev, ROOT, ""),
            Err(CfsError::Param(_))
        ));
        let long = format!("/{}", "a/".repeat(MAX_PATH_LEN / 2));
        assert!(matches!(
            realpath(&mut cache, dev, ROOT, &long),
            Err(CfsError::NameTooLong)
        ));
        assert!(matches!(
            realpath(&mut cache, dev, FILE, "x"),
            Err(CfsError::NotDirectory)
        ));
        // Absolute paths never consult the working directory.
        assert_eq!(realpath(&mut cache, dev, FILE, "/x").unwrap(), "/x");
    }

    #[test]
    fn relative_path_that_grows_too_long_is_rejected() {
        let (mut cache, dev) = tree();
        let name = "n".repeat(NAME_MAX - 1);
        let path = format!("{name}/{name}");
        assert!(path.len() <= MAX_PATH_LEN);
        assert!(matches!(
            realpath(&mut cache, dev, B, &path),
            Err(CfsError::NameTooLong)
        ));
    }

    #[test]
    fn parent_cycle_is_inconsistent() {
        let (mut cache, dev) = tree();
        let mut a = read_inode(&mut cache, dev, A).unwrap();
        a.parent = B;
        write_inode(&mut cache, dev, &a).unwrap();
        assert!(matches!(
            inode_path(&mut cache, dev, B),
            Err(CfsError::Inconsistent { .. })
        ));
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent_and_dot_free(
            parts in proptest::collection::vec(prop_oneof![
                Just(".".to_owned()),
                Just("..".to_owned()),
                Just(String::new()),
                "[a-z]{1,4}",
            ], 0..12)
        ) {
            let path = format!("/{}", parts.join("/"));
            let once = normalize(&path);
            prop_assert!(once.starts_with('/'));
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert!(components(&once).all(|c| c != "." && c != ".."));
        }
    }
}
