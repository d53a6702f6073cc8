//! Compares tracked allocation and bulk release with individually freed boxes.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use thread_arena::{Arena, release_current_thread_tracked, tracked_alloc, tracked_sprintf};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BATCH_SIZE: usize = 100;
const PAYLOAD_SIZE: usize = 48;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracked_alloc");

    group.bench_function("box_batch", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                let boxes = (0..BATCH_SIZE)
                    .map(|_| Box::new([0_u8; PAYLOAD_SIZE]))
                    .collect::<Vec<_>>();
                drop(black_box(boxes));
            }

            start.elapsed()
        });
    });

    group.bench_function("thread_registry_batch", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..BATCH_SIZE {
                    black_box(tracked_alloc(PAYLOAD_SIZE));
                }

                release_current_thread_tracked();
            }

            start.elapsed()
        });
    });

    group.bench_function("arena_batch", |b| {
        b.iter_custom(|iters| {
            let mut arena = Arena::new();

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..BATCH_SIZE {
                    black_box(arena.alloc_zeroed(PAYLOAD_SIZE));
                }

                arena.release();
            }

            start.elapsed()
        });
    });

    group.bench_function("sprintf_short", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for i in 0..iters {
                black_box(tracked_sprintf!("item {i}"));
            }

            let elapsed = start.elapsed();
            release_current_thread_tracked();
            elapsed
        });
    });

    let long_argument = "x".repeat(500);
    group.bench_function("sprintf_long", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                black_box(tracked_sprintf!("[{long_argument}]"));
            }

            let elapsed = start.elapsed();
            release_current_thread_tracked();
            elapsed
        });
    });

    group.finish();
}
