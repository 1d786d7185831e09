#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs::{
    CacheConfig, FileBlockDevice, Filesystem, FsStats, InodeKind, MkfsOptions, OpenFlags,
    OpenOptions, Permissions,
};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::Path;
use tracing::debug;

const DEFAULT_IMAGE_BLOCKS: u32 = 4096;

#[derive(Debug, Serialize)]
struct InspectOutput {
    image: String,
    block_start: u32,
    #[serde(flatten)]
    counters: FsStats,
    /// Free counts recounted from the bitmaps.
    bitmap_free_inodes: u32,
    bitmap_free_blocks: u32,
    consistent: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (verbose, rest): (Vec<String>, Vec<String>) = env::args()
        .skip(1)
        .partition(|arg| arg == "--verbose" || arg == "-v");
    if !verbose.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let mut args = rest.into_iter();
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(image) = args.next() else {
                bail!("mkfs requires <image>");
            };
            let remaining: Vec<String> = args.collect();
            let blocks = match flag_value(&remaining, "--blocks") {
                Some(value) => value
                    .parse::<u32>()
                    .with_context(|| format!("invalid block count: {value}"))?,
                None => DEFAULT_IMAGE_BLOCKS,
            };
            mkfs_cmd(Path::new(&image), blocks)
        }
        "inspect" => {
            let Some(image) = args.next() else {
                bail!("inspect requires <image>");
            };
            let json = args.any(|arg| arg == "--json");
            let output = inspect(Path::new(&image))?;
            print_inspect(&output, json)
        }
        "put" => {
            let (Some(image), Some(host), Some(path)) = (args.next(), args.next(), args.next())
            else {
                bail!("put requires <image> <host-file> <path>");
            };
            let data = std::fs::read(&host).with_context(|| format!("failed to read {host}"))?;
            put_cmd(Path::new(&image), &path, &data)
        }
        "cat" => {
            let (Some(image), Some(path)) = (args.next(), args.next()) else {
                bail!("cat requires <image> <path>");
            };
            let stdout = std::io::stdout();
            cat_cmd(Path::new(&image), &path, &mut stdout.lock())
        }
        "mkdir" => {
            let (Some(image), Some(path)) = (args.next(), args.next()) else {
                bail!("mkdir requires <image> <path>");
            };
            with_mounted(Path::new(&image), |fs, dev| {
                fs.mkdir(dev, &path, Permissions::from_bits(0o755))
                    .with_context(|| format!("mkdir {path}"))?;
                Ok(())
            })
        }
        "rm" => {
            let (Some(image), Some(path)) = (args.next(), args.next()) else {
                bail!("rm requires <image> <path>");
            };
            rm_cmd(Path::new(&image), &path)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cfs\n");
    println!("USAGE:");
    println!("  cfs [--verbose] mkfs <image> [--blocks N]");
    println!("  cfs [--verbose] inspect <image> [--json]");
    println!("  cfs [--verbose] put <image> <host-file> <path>");
    println!("  cfs [--verbose] cat <image> <path>");
    println!("  cfs [--verbose] mkdir <image> <path>");
    println!("  cfs [--verbose] rm <image> <path>");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Mount `image`, run `body`, and unmount even when `body` fails.
fn with_mounted<T>(
    image: &Path,
    body: impl FnOnce(&mut Filesystem, cfs::DeviceId) -> Result<T>,
) -> Result<T> {
    let mut fs = Filesystem::new(CacheConfig::default())?;
    let dev = fs
        .mount(image, &OpenOptions::default())
        .with_context(|| format!("failed to mount {}", image.display()))?;
    let outcome = body(&mut fs, dev);
    let closed = fs
        .dev_close(dev)
        .with_context(|| format!("failed to flush {}", image.display()));
    let value = outcome?;
    closed?;
    Ok(value)
}

fn mkfs_cmd(image: &Path, blocks: u32) -> Result<()> {
    let device = FileBlockDevice::create(image, blocks)
        .with_context(|| format!("failed to create {}", image.display()))?;
    let mut fs = Filesystem::new(CacheConfig::default())?;
    let dev = fs.attach_device(image.display().to_string(), Box::new(device))?;
    let master = fs
        .create_fs(dev, &MkfsOptions::default())
        .with_context(|| format!("failed to format {}", image.display()))?;
    fs.dev_close(dev)?;
    println!(
        "formatted {}: {} blocks, {} inodes, {} data blocks",
        image.display(),
        master.total_blocks,
        master.inode_table.len(),
        master.data.len()
    );
    Ok(())
}

fn inspect(image: &Path) -> Result<InspectOutput> {
    with_mounted(image, |fs, dev| {
        let counters = fs.statfs(dev)?;
        let scanned = fs.scan_free_space(dev)?;
        let block_start = fs.master(dev)?.block_start.0;
        Ok(InspectOutput {
            image: image.display().to_string(),
            block_start,
            counters,
            bitmap_free_inodes: scanned.free_inodes,
            bitmap_free_blocks: scanned.free_blocks,
            consistent: scanned == counters,
        })
    })
}

fn print_inspect(output: &InspectOutput, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("serialize output")?
        );
        return Ok(());
    }
    println!("chainfs inspector");
    println!("image: {}", output.image);
    println!("block_size: {}", output.counters.block_size);
    println!("block_start: {}", output.block_start);
    println!("total_blocks: {}", output.counters.total_blocks);
    println!(
        "inodes: {} ({} free, bitmap says {})",
        output.counters.inodes, output.counters.free_inodes, output.bitmap_free_inodes
    );
    println!(
        "data_blocks: {} ({} free, bitmap says {})",
        output.counters.data_blocks, output.counters.free_blocks, output.bitmap_free_blocks
    );
    println!("consistent: {}", output.consistent);
    Ok(())
}

fn put_cmd(image: &Path, path: &str, data: &[u8]) -> Result<()> {
    with_mounted(image, |fs, dev| {
        let mut file = fs
            .open(dev, path, OpenFlags::create())
            .with_context(|| format!("open {path}"))?;
        let written = fs.write(&mut file, data)?;
        fs.close(file)?;
        debug!(path, written, "put");
        Ok(())
    })
}

fn cat_cmd(image: &Path, path: &str, out: &mut impl Write) -> Result<()> {
    with_mounted(image, |fs, dev| {
        let mut file = fs
            .open(dev, path, OpenFlags::read_only())
            .with_context(|| format!("open {path}"))?;
        let mut buf = vec![0_u8; 64 * 1024];
        loop {
            let n = fs.read(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
        fs.close(file)?;
        out.flush()?;
        Ok(())
    })
}

fn rm_cmd(image: &Path, path: &str) -> Result<()> {
    with_mounted(image, |fs, dev| {
        let attr = fs.lstat(dev, path).with_context(|| format!("rm {path}"))?;
        let removed = if attr.kind == InodeKind::Directory {
            fs.rmdir(dev, path)
        } else {
            fs.unlink(dev, path)
        };
        removed.with_context(|| format!("rm {path}"))
    })
}
