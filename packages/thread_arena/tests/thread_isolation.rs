//! Tracked allocations of one thread are invisible to, and unaffected by, other threads.

use std::sync::{Arc, Barrier};
use std::thread;

use thread_arena::{
    current_thread_usage, release_current_thread_tracked, tracked_alloc, tracked_zalloc,
};

const THREADS: usize = 8;

#[test]
fn release_on_one_thread_does_not_affect_another() {
    let barrier = Arc::new(Barrier::new(2));

    let keeper = thread::spawn({
        let barrier = Arc::clone(&barrier);

        move || {
            let block = tracked_zalloc(256);
            // SAFETY: The block is live and 256 bytes long.
            unsafe { block.cast::<u8>().write_bytes(0x5A, 256) };

            // Let the other thread allocate and release.
            barrier.wait();
            barrier.wait();

            // SAFETY: This thread has not released anything since the block was made.
            let bytes = unsafe { block.as_ref() };
            assert!(bytes.iter().all(|b| *b == 0x5A));
            assert_eq!(current_thread_usage().allocations, 1);
            assert_eq!(current_thread_usage().bytes, 256);

            release_current_thread_tracked();
        }
    });

    let releaser = thread::spawn({
        let barrier = Arc::clone(&barrier);

        move || {
            barrier.wait();

            assert_eq!(current_thread_usage().allocations, 0);

            for _ in 0..100 {
                _ = tracked_alloc(256);
            }
            release_current_thread_tracked();
            release_current_thread_tracked();

            barrier.wait();
        }
    });

    keeper.join().unwrap();
    releaser.join().unwrap();
}

#[test]
fn concurrent_threads_track_independently() {
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles = (0..THREADS)
        .map(|index| {
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                let fill = u8::try_from(index).unwrap();
                let count = index + 1;

                let blocks = (0..count)
                    .map(|_| {
                        let block = tracked_alloc(32);
                        // SAFETY: The block is live and 32 bytes long.
                        unsafe { block.cast::<u8>().write_bytes(fill, 32) };
                        block
                    })
                    .collect::<Vec<_>>();

                // Everyone has allocated before anyone checks or releases.
                barrier.wait();

                assert_eq!(current_thread_usage().allocations, count);

                for block in &blocks {
                    // SAFETY: This thread has not released anything since the blocks were made.
                    let bytes = unsafe { block.as_ref() };
                    assert!(bytes.iter().all(|b| *b == fill));
                }

                barrier.wait();
                release_current_thread_tracked();
                assert_eq!(current_thread_usage().allocations, 0);
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn new_thread_starts_with_nothing_tracked() {
    _ = tracked_alloc(1);

    let usage_elsewhere = thread::spawn(current_thread_usage).join().unwrap();

    assert_eq!(usage_elsewhere.allocations, 0);
    assert_eq!(usage_elsewhere.bytes, 0);

    release_current_thread_tracked();
}
