//! Allocation throughput benchmarks

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use vela_memory::{BlockPool, OsBackend};

fn bench_thread_local_bump(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_local_bump");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("alloc_64b_x10k", |b| {
        b.iter_batched(
            || {
                let pool = BlockPool::new(Arc::new(OsBackend), false);
                pool.init(4 << 20, None).unwrap();
                pool
            },
            |pool| {
                let local = pool.thread_local();
                for _ in 0..10_000 {
                    criterion::black_box(local.alloc0(64, 16).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_pool_refill(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_refill");
    group.throughput(Throughput::Elements(256));

    group.bench_function("direct_16k_x256", |b| {
        b.iter_batched(
            || {
                let pool = BlockPool::new(Arc::new(OsBackend), false);
                pool.init(8 << 20, None).unwrap();
                pool
            },
            |pool| {
                for _ in 0..256 {
                    criterion::black_box(pool.allocate(16 * 1024, 64, false).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_reset_reuse(c: &mut Criterion) {
    c.bench_function("reset_and_refill", |b| {
        let pool = BlockPool::new(Arc::new(OsBackend), false);
        pool.init(4 << 20, None).unwrap();
        b.iter(|| {
            for _ in 0..1_000 {
                criterion::black_box(pool.allocate(256, 16, false).unwrap());
            }
            pool.reset();
        });
    });
}

criterion_group!(benches, bench_thread_local_bump, bench_pool_refill, bench_reset_reuse);
criterion_main!(benches);
