//! Demonstrates per-thread tracked allocations being released explicitly and at thread exit.
//!
//! Run with: `RUST_LOG=trace cargo run --example thread_arena_basic`

use std::thread;

use thread_arena::{
    Arena, current_thread_usage, release_current_thread_tracked, tracked_alloc, tracked_sprintf,
    tracked_strdup,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Explicit release ===");

    for unit_of_work in 0..3 {
        let label = tracked_sprintf!("unit of work #{unit_of_work}");
        let owner = tracked_strdup("main thread");
        let _scratch = tracked_alloc(4096);

        // SAFETY: Nothing has been released on this thread since `label` was created.
        let label = unsafe { label.as_str() };
        // SAFETY: Nothing has been released on this thread since `owner` was created.
        let owner = unsafe { owner.as_str() };
        println!("{label} on {owner}: {:?}", current_thread_usage());

        release_current_thread_tracked();
    }

    println!("After release: {:?}", current_thread_usage());

    println!("\n=== Release at thread exit ===");

    thread::spawn(|| {
        for _ in 0..1000 {
            _ = tracked_alloc(64);
        }

        println!("Worker before exit: {:?}", current_thread_usage());
    })
    .join()
    .unwrap();

    println!("Worker exited; its allocations were released by the thread-exit hook.");

    println!("\n=== Scoped arena ===");

    let mut arena = Arena::new();
    let greeting = arena.alloc_fmt(format_args!("hello from {}", "an arena"));
    println!("{greeting} ({:?})", arena.usage());
    arena.release();
    println!("After release: {:?}", arena.usage());
}
