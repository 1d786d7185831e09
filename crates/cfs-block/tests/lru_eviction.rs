#![forbid(unsafe_code)]

use cfs_block::{BlockCache, BlockDevice, CacheConfig, MemBlockDevice};
use cfs_types::{BLOCK_SIZE, BlockNumber};
use proptest::prelude::*;

fn filled(tag: u32) -> [u8; BLOCK_SIZE] {
    let mut buf = [0_u8; BLOCK_SIZE];
    buf[..4].copy_from_slice(&tag.to_le_bytes());
    buf
}

#[test]
fn touching_capacity_plus_one_blocks_evicts_least_recent_clean() {
    const N: u32 = 8;
    let mut cache = BlockCache::new(CacheConfig {
        capacity_blocks: N as usize,
    })
    .expect("cache");
    let mem = MemBlockDevice::new(64);
    for block in 1..=N + 1 {
        mem.write_block(BlockNumber(block), &filled(block))
            .expect("seed");
    }
    let dev = cache.attach("mem", Box::new(mem)).expect("attach");

    let mut out = [0_u8; BLOCK_SIZE];
    for block in 1..=N {
        cache.read(dev, BlockNumber(block), &mut out).expect("fill");
    }
    // Re-touch block 1 so block 2 becomes the least recently used.
    cache.read(dev, BlockNumber(1), &mut out).expect("touch");
    cache.read(dev, BlockNumber(N + 1), &mut out).expect("miss");

    assert_eq!(cache.resident_count(), N as usize);
    assert!(cache.is_resident(dev, BlockNumber(1)));
    assert!(!cache.is_resident(dev, BlockNumber(2)));
    assert!(cache.is_resident(dev, BlockNumber(N + 1)));
    assert_eq!(out, filled(N + 1));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn dirty_blocks_survive_until_all_clean_ones_are_gone() {
    let mut cache = BlockCache::new(CacheConfig { capacity_blocks: 4 }).expect("cache");
    let mem = MemBlockDevice::new(64);
    let dev = cache.attach("mem", Box::new(mem.clone())).expect("attach");

    // Oldest two are dirty, newest two clean.
    cache.write(dev, BlockNumber(1), &filled(1)).expect("w1");
    cache.write(dev, BlockNumber(2), &filled(2)).expect("w2");
    let mut out = [0_u8; BLOCK_SIZE];
    cache.read(dev, BlockNumber(3), &mut out).expect("r3");
    cache.read(dev, BlockNumber(4), &mut out).expect("r4");

    cache.read(dev, BlockNumber(5), &mut out).expect("r5");
    cache.read(dev, BlockNumber(6), &mut out).expect("r6");
    assert!(cache.is_dirty(dev, BlockNumber(1)));
    assert!(cache.is_dirty(dev, BlockNumber(2)));
    assert!(!cache.is_resident(dev, BlockNumber(3)));
    assert!(!cache.is_resident(dev, BlockNumber(4)));
    assert_eq!(mem.snapshot(BlockNumber(1)).expect("snap"), [0_u8; BLOCK_SIZE]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Against a plain model of the disk, every read returns the last value
    /// written, the cache never exceeds its capacity, and after `sync` the
    /// device matches the model.
    #[test]
    fn cache_matches_model(
        capacity in 1_usize..6,
        ops in proptest::collection::vec((any::<bool>(), 1_u32..24, any::<u8>()), 1..120),
    ) {
        let mut cache = BlockCache::new(CacheConfig { capacity_blocks: capacity }).expect("cache");
        let mem = MemBlockDevice::new(24);
        let dev = cache.attach("mem", Box::new(mem.clone())).expect("attach");
        let mut model = vec![[0_u8; BLOCK_SIZE]; 24];

        for (is_write, block, byte) in ops {
            let idx = block as usize;
            if is_write {
                let data = [byte; BLOCK_SIZE];
                cache.write(dev, BlockNumber(block), &data).expect("write");
                model[idx] = data;
            } else {
                let mut out = [0_u8; BLOCK_SIZE];
                cache.read(dev, BlockNumber(block), &mut out).expect("read");
                prop_assert_eq!(out, model[idx]);
            }
            prop_assert!(cache.resident_count() <= capacity);
        }

        cache.sync(dev).expect("sync");
        prop_assert_eq!(cache.dirty_count(dev), 0);
        for block in 1..24_u32 {
            prop_assert_eq!(mem.snapshot(BlockNumber(block)).expect("snap"), model[block as usize]);
        }
    }
}
