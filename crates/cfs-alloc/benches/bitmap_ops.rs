//! Benchmark: bitmap primitives and cursor-driven allocation.

use cfs_alloc::{SpaceAllocator, bitmap_count_free, bitmap_next_free};
use cfs_block::{BlockCache, CacheConfig, MemBlockDevice};
use cfs_ondisk::MasterRecord;
use cfs_types::{BITS_PER_BLOCK, BLOCK_SIZE, BlockNumber};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

/// One bitmap page, ~5% free in clusters of 32 bits.
fn make_page() -> [u8; BLOCK_SIZE] {
    let mut bm = [0xFF_u8; BLOCK_SIZE];
    let mut pos = 100_usize;
    while pos + 32 < BITS_PER_BLOCK as usize {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn bench_page_scan(c: &mut Criterion) {
    let page = make_page();
    let mut group = c.benchmark_group("bitmap_page");

    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&page), BITS_PER_BLOCK)));
    });
    group.bench_function("next_free", |b| {
        b.iter(|| black_box(bitmap_next_free(black_box(&page), BITS_PER_BLOCK, black_box(2000))));
    });

    group.finish();
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let total = 20_000;
    let mut cache = BlockCache::new(CacheConfig { capacity_blocks: 32 }).expect("cache");
    let dev = cache
        .attach("bench", Box::new(MemBlockDevice::new(total)))
        .expect("attach");
    let master = MasterRecord::layout(1, total).expect("layout");
    cache
        .write(dev, BlockNumber(1), &master.to_block())
        .expect("master");
    let mut alloc = SpaceAllocator::new();
    alloc.load(&mut cache, dev, BlockNumber(1)).expect("load");

    c.bench_function("alloc_free_data_block", |b| {
        b.iter(|| {
            let block = alloc.allocate_data_block(&mut cache, dev).expect("alloc");
            alloc
                .free_data_block(&mut cache, dev, black_box(block))
                .expect("free");
        });
    });
}

criterion_group!(benches, bench_page_scan, bench_alloc_free_cycle);
criterion_main!(benches);
