//! Benchmarks for staging buffer lease/release and I/O

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nestar_rs::BufferPool;
use std::io::{Read, Write};

fn benchmark_lease_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_lease");

    group.bench_function("memory", |b| {
        let pool = BufferPool::in_memory();
        b.iter(|| {
            let buffer = pool.allocate().unwrap();
            pool.release(black_box(&buffer)).unwrap();
        });
    });

    group.bench_function("temp_file", |b| {
        let pool = BufferPool::temp_file();
        b.iter(|| {
            let buffer = pool.allocate().unwrap();
            pool.release(black_box(&buffer)).unwrap();
        });
    });

    group.finish();
}

fn benchmark_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_write_read");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        let data = vec![0xABu8; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        for (label, pool) in [
            ("memory", BufferPool::in_memory()),
            ("temp_file", BufferPool::temp_file()),
        ] {
            group.bench_with_input(BenchmarkId::new(label, size), &data, |b, data| {
                b.iter(|| {
                    let buffer = pool.allocate().unwrap();
                    buffer.writer().unwrap().write_all(data).unwrap();
                    let mut out = Vec::with_capacity(data.len());
                    buffer.reader().unwrap().read_to_end(&mut out).unwrap();
                    black_box(out.len());
                    pool.release(&buffer).unwrap();
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_lease_release, benchmark_write_read);
criterion_main!(benches);
