#![forbid(unsafe_code)]
//! E2E tests for image files on the host filesystem.
//!
//! Scenarios tested:
//! 1. A tree written through one `Filesystem` is read back by a fresh one.
//! 2. Master record counters survive an unmount and agree with the bitmaps.
//! 3. Two images mounted side by side through one cache stay independent.
//! 4. Mount failures release the image.

use cfs_core::{
    CacheConfig, CfsError, FileBlockDevice, Filesystem, InodeKind, MkfsOptions, OpenFlags,
    OpenOptions, Permissions,
};
use std::path::Path;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_image(path: &Path, blocks: u32) {
    let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
    let device = FileBlockDevice::create(path, blocks).unwrap();
    let dev = fs.attach_device(path.display().to_string(), Box::new(device)).unwrap();
    fs.create_fs(dev, &MkfsOptions::default()).unwrap();
    fs.dev_close(dev).unwrap();
}

fn put(fs: &mut Filesystem, dev: cfs_core::DeviceId, path: &str, data: &[u8]) {
    let mut file = fs.open(dev, path, OpenFlags::create()).unwrap();
    assert_eq!(fs.write(&mut file, data).unwrap(), data.len());
    fs.close(file).unwrap();
}

fn get(fs: &mut Filesystem, dev: cfs_core::DeviceId, path: &str) -> Vec<u8> {
    let size = usize::try_from(fs.stat(dev, path).unwrap().size).unwrap();
    let mut file = fs.open(dev, path, OpenFlags::read_only()).unwrap();
    let mut buf = vec![0; size];
    assert_eq!(fs.read(&mut file, &mut buf).unwrap(), size);
    buf
}

// ---------------------------------------------------------------------------
// Scenario 1 + 2: remount
// ---------------------------------------------------------------------------

#[test]
fn tree_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");
    format_image(&image, 4096);
    let body: Vec<u8> = (0..70_000_u32).map(|i| (i % 253) as u8).collect();

    let master = {
        let mut fs = Filesystem::new(CacheConfig { capacity_blocks: 16 }).unwrap();
        let dev = fs.mount(&image, &OpenOptions::default()).unwrap();
        fs.mkdir(dev, "/etc", Permissions::from_bits(0o755)).unwrap();
        put(&mut fs, dev, "/etc/motd", b"welcome\n");
        put(&mut fs, dev, "/blob", &body);
        fs.symlink(dev, "/etc/motd", "/motd").unwrap();
        fs.link(dev, "/blob", "/blob.hard").unwrap();
        let master = *fs.master(dev).unwrap();
        assert!(fs.cache_stats().evictions > 0);
        fs.dev_close(dev).unwrap();
        master
    };

    let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
    let dev = fs.mount(&image, &OpenOptions::default()).unwrap();
    assert_eq!(*fs.master(dev).unwrap(), master);
    assert_eq!(fs.statfs(dev).unwrap(), fs.scan_free_space(dev).unwrap());

    assert_eq!(get(&mut fs, dev, "/etc/motd"), b"welcome\n");
    assert_eq!(get(&mut fs, dev, "/motd"), b"welcome\n");
    assert_eq!(get(&mut fs, dev, "/blob.hard"), body);
    assert_eq!(fs.stat(dev, "/blob").unwrap().refcount, 1);
    assert_eq!(fs.stat(dev, "/etc").unwrap().perm.bits(), 0o755);
    assert_eq!(fs.lstat(dev, "/motd").unwrap().kind, InodeKind::Symlink);
    fs.dev_close(dev).unwrap();
}

#[test]
fn removals_survive_remount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");
    format_image(&image, 2048);

    let fresh = {
        let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
        let dev = fs.mount(&image, &OpenOptions::default()).unwrap();
        let fresh = fs.statfs(dev).unwrap();
        put(&mut fs, dev, "/tmp", &[1; 4000]);
        fs.mkdir(dev, "/d", Permissions::ALL).unwrap();
        fs.rename(dev, "/tmp", "/d/kept").unwrap();
        fs.dev_close(dev).unwrap();
        fresh
    };

    let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
    let dev = fs.mount(&image, &OpenOptions::default()).unwrap();
    assert!(matches!(fs.stat(dev, "/tmp"), Err(CfsError::NotFound(_))));
    assert_eq!(get(&mut fs, dev, "/d/kept"), vec![1; 4000]);
    fs.unlink(dev, "/d/kept").unwrap();
    fs.rmdir(dev, "/d").unwrap();
    fs.dev_close(dev).unwrap();

    let dev = fs.mount(&image, &OpenOptions::default()).unwrap();
    assert_eq!(fs.statfs(dev).unwrap(), fresh);
    assert_eq!(fs.scan_free_space(dev).unwrap(), fresh);
}

// ---------------------------------------------------------------------------
// Scenario 3: several devices
// ---------------------------------------------------------------------------

#[test]
fn two_images_share_one_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (a_path, b_path) = (dir.path().join("a.img"), dir.path().join("b.img"));
    format_image(&a_path, 1024);
    format_image(&b_path, 1024);

    let mut fs = Filesystem::new(CacheConfig { capacity_blocks: 8 }).unwrap();
    let a = fs.mount(&a_path, &OpenOptions::default()).unwrap();
    let b = fs.mount(&b_path, &OpenOptions::default()).unwrap();
    assert_ne!(a, b);
    put(&mut fs, a, "/same", b"from a");
    put(&mut fs, b, "/same", b"from b, longer");
    assert_eq!(get(&mut fs, a, "/same"), b"from a");
    assert_eq!(get(&mut fs, b, "/same"), b"from b, longer");

    // The same image cannot be registered twice.
    assert!(matches!(
        fs.mount(&a_path, &OpenOptions::default()),
        Err(CfsError::Param(_))
    ));

    fs.dev_close(a).unwrap();
    assert!(matches!(fs.stat(a, "/same"), Err(CfsError::Param(_))));
    assert_eq!(get(&mut fs, b, "/same"), b"from b, longer");
    fs.dev_close(b).unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 4: failed mounts
// ---------------------------------------------------------------------------

#[test]
fn failed_mount_releases_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("blank.img");
    drop(FileBlockDevice::create(&image, 256).unwrap());

    let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
    assert!(matches!(
        fs.mount(&image, &OpenOptions::default()),
        Err(CfsError::Format(_))
    ));
    // The image was closed again, so it can be registered and formatted.
    let dev = fs.open_device(&image).unwrap();
    fs.create_fs(dev, &MkfsOptions::default()).unwrap();
    fs.dev_open(dev, &OpenOptions::default()).unwrap();
    assert_eq!(fs.stat(dev, "/").unwrap().kind, InodeKind::Directory);
}

#[test]
fn missing_image_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = Filesystem::new(CacheConfig::default()).unwrap();
    assert!(matches!(
        fs.mount(dir.path().join("nope.img"), &OpenOptions::default()),
        Err(CfsError::Io(_))
    ));
}
