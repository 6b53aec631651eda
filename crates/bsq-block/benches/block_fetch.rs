#![forbid(unsafe_code)]

use asupersync::Cx;
use bsq_block::{BlockFetcher, ByteBlockDevice, MemoryByteDevice};
use bsq_types::DataLength;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

// ── In-memory image (no file I/O) ───────────────────────────────────────

fn make_device(block_size: u32, block_count: usize) -> ByteBlockDevice<MemoryByteDevice> {
    let image: Vec<u8> = (0..block_size as usize * block_count)
        .map(|i| (i % 251) as u8)
        .collect();
    ByteBlockDevice::new(MemoryByteDevice::new(image), block_size).expect("device")
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_data_block_128k(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let dev = make_device(1024, 512);
    let fetcher = BlockFetcher::new(&dev, 512 * 1024);

    c.bench_function("fetch_data_128k_unaligned", |b| {
        b.iter(|| {
            let fetched = fetcher
                .fetch_data(
                    black_box(&cx),
                    black_box(777),
                    DataLength::uncompressed(128 * 1024),
                    128 * 1024,
                )
                .expect("fetch");
            black_box(fetched.raw.len());
        });
    });
}

fn bench_metadata_block_straddling(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let mut image = vec![0_u8; 4096 * 8];
    let index = 4095;
    image[index..index + 2].copy_from_slice(&(8000_u16 | 0x8000).to_le_bytes());
    let dev = ByteBlockDevice::new(MemoryByteDevice::new(image), 4096).expect("device");
    let fetcher = BlockFetcher::new(&dev, 4096 * 8);

    c.bench_function("fetch_metadata_straddling_header", |b| {
        b.iter(|| {
            let fetched = fetcher
                .fetch_metadata(black_box(&cx), black_box(index as u64), 8192)
                .expect("fetch");
            black_box(fetched.next_index);
        });
    });
}

criterion_group!(
    fetch_benches,
    bench_data_block_128k,
    bench_metadata_block_straddling,
);
criterion_main!(fetch_benches);
