//! Basic operations on the `BlockPool` type, compared with the system allocator.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;
use std::ptr::NonNull;
use std::time::Instant;

use block_pool::{BlockPool, PoolAttributes};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const OBJECT_SIZE: usize = 24;
const BATCH_SIZE: usize = 1000;

fn warm_pool() -> BlockPool {
    let pool = BlockPool::builder()
        .object_size(OBJECT_SIZE)
        .attributes(PoolAttributes::new().with_min_cached_objects(BATCH_SIZE))
        .build();

    // Grow the pool once so the measured operations never reach the backing allocator.
    let objects: Vec<_> = (0..BATCH_SIZE).map(|_| pool.alloc().unwrap()).collect();

    for object in objects {
        // SAFETY: Allocated from this pool above.
        unsafe { pool.dealloc(object) };
    }

    pool
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("bp_basic");

    group.bench_function("build_empty", |b| {
        b.iter(|| drop(black_box(BlockPool::new(OBJECT_SIZE))));
    });

    group.bench_function("alloc_dealloc_one", |b| {
        let pool = warm_pool();

        b.iter(|| {
            let object = pool.alloc().unwrap();
            // SAFETY: Allocated from this pool just above.
            unsafe { pool.dealloc(black_box(object)) };
        });
    });

    group.bench_function("alloc_dealloc_batch", |b| {
        let pool = warm_pool();
        let mut objects = Vec::with_capacity(BATCH_SIZE);

        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                objects.extend((0..BATCH_SIZE).map(|_| pool.alloc().unwrap()));

                for object in objects.drain(..) {
                    // SAFETY: Allocated from this pool just above.
                    unsafe { pool.dealloc(black_box(object)) };
                }
            }

            start.elapsed()
        });
    });

    group.bench_function("system_alloc_dealloc_batch", |b| {
        let layout = Layout::from_size_align(OBJECT_SIZE, 4).unwrap();
        let mut objects: Vec<NonNull<u8>> = Vec::with_capacity(BATCH_SIZE);

        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                objects.extend((0..BATCH_SIZE).map(|_| {
                    // SAFETY: The layout has a non-zero size.
                    NonNull::new(unsafe { System.alloc(layout) }).unwrap()
                }));

                for object in objects.drain(..) {
                    // SAFETY: Allocated from the system allocator with the same layout above.
                    unsafe { System.dealloc(black_box(object).as_ptr(), layout) };
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}
