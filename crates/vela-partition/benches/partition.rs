//! Partition throughput: serial vs parallel

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vela_partition::{parallel_partition, serial_partition};

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_u32_sum");

    for shift in [16u32, 20] {
        let n = 1usize << shift;
        let mut rng = StdRng::seed_from_u64(42);
        let input: Vec<u32> = (0..n).map(|_| rng.gen_range(0..1000)).collect();
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("serial", n), &input, |b, input| {
            b.iter_batched(
                || input.clone(),
                |mut data| {
                    let mut left = 0u64;
                    let mut right = 0u64;
                    serial_partition(
                        &mut data,
                        &mut left,
                        &mut right,
                        &|x| *x < 300,
                        &|acc, x| *acc += u64::from(*x),
                    )
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("parallel", n), &input, |b, input| {
            b.iter_batched(
                || input.clone(),
                |mut data| {
                    parallel_partition::<4096, _, _, _, _, _>(
                        &mut data,
                        0u64,
                        &|x| *x < 300,
                        &|acc, x| *acc += u64::from(*x),
                        &|acc, other| *acc += other,
                        None,
                    )
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_partition);
criterion_main!(benches);
