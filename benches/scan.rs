use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use upsweep::gpu::{ScanEngine, ScanKind, SupportResources};
use upsweep::reference;

const SIZES: &[usize] = &[1 << 10, 1 << 14, 1 << 18, 1 << 22];

fn test_data(n: usize) -> Vec<u32> {
    let mut state = 0x1234_5678u32;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            state >> 20
        })
        .collect()
}

fn bench_reference(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_cpu");
    for &size in SIZES {
        let data = test_data(size);
        group.throughput(Throughput::Bytes(size as u64 * 4));
        group.bench_with_input(BenchmarkId::new("inclusive", size), &data, |b, data| {
            b.iter(|| {
                let mut v = data.clone();
                reference::inclusive(&mut v);
                v
            });
        });
    }
    group.finish();
}

fn bench_gpu(c: &mut Criterion) {
    let mut engine = match ScanEngine::new() {
        Ok(e) => e,
        Err(_) => {
            eprintln!("scan: no compute device, skipping GPU benchmarks");
            return;
        }
    };
    engine.init();

    let mut group = c.benchmark_group("scan_gpu");
    for &size in SIZES {
        let data = test_data(size);
        let mut resources = SupportResources::new(engine.device(), size as u32).unwrap();
        group.throughput(Throughput::Bytes(size as u64 * 4));

        group.bench_with_input(BenchmarkId::new("inclusive", size), &data, |b, data| {
            b.iter(|| engine.prefix_sum(&mut resources, data, ScanKind::Inclusive).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("exclusive", size), &data, |b, data| {
            b.iter(|| engine.prefix_sum(&mut resources, data, ScanKind::Exclusive).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reference, bench_gpu);
criterion_main!(benches);
