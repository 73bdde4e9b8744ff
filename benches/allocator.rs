//! Host allocator churn benchmark, the same shape as `spec.md` §8's
//! end-to-end scenario 1: alloc 64 B, alloc 1 KiB, free both, repeated.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use exsa_core::rt::HostAllocator;

fn churn(allocator: &HostAllocator, iterations: usize) {
    for _ in 0..iterations {
        let a = allocator.alloc(64, 8);
        let b = allocator.alloc(1024, 8);
        unsafe {
            allocator.free(a);
            allocator.free(b);
        }
    }
}

fn bench_allocator_churn(c: &mut Criterion) {
    let allocator = HostAllocator::new(6, 20, 20);
    c.bench_function("allocator_churn_1000", |bencher| {
        bencher.iter(|| churn(black_box(&allocator), 1000));
    });
}

criterion_group!(benches, bench_allocator_churn);
criterion_main!(benches);
