//! Verifies that allocations left tracked by a thread are released when the thread exits.
//!
//! This binary installs a counting global allocator and contains a single test, so that no
//! other test activity disturbs the byte counts.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::thread;

use thread_arena::{current_thread_usage, release_current_thread_tracked, tracked_alloc};

struct CountingAllocator;

static LIVE_BYTES: AtomicIsize = AtomicIsize::new(0);

// SAFETY: We forward to the system allocator and only add bookkeeping.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        let ptr = unsafe { System.alloc(layout) };

        if !ptr.is_null() {
            LIVE_BYTES.fetch_add(signed(layout.size()), Ordering::Relaxed);
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE_BYTES.fetch_sub(signed(layout.size()), Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.dealloc(ptr, layout) }
    }
}

fn signed(bytes: usize) -> isize {
    isize::try_from(bytes).expect("layout sizes never exceed isize::MAX")
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

const ALLOCATIONS: usize = 1000;
const SIZE: usize = 64;

/// Runs `work` on a new thread and returns the live byte count observed by that thread just
/// before it finished, together with the live byte count after it was joined.
fn measure_thread(work: fn()) -> (isize, isize) {
    let observed_inside = thread::spawn(move || {
        work();
        LIVE_BYTES.load(Ordering::Relaxed)
    })
    .join()
    .unwrap();

    (observed_inside, LIVE_BYTES.load(Ordering::Relaxed))
}

fn allocate_without_release() {
    for _ in 0..ALLOCATIONS {
        _ = tracked_alloc(SIZE);
    }

    assert_eq!(current_thread_usage().allocations, ALLOCATIONS);
    assert_eq!(current_thread_usage().bytes, ALLOCATIONS * SIZE);
}

fn allocate_release_and_allocate_again() {
    allocate_without_release();
    release_current_thread_tracked();
    assert_eq!(current_thread_usage().allocations, 0);

    allocate_without_release();
}

#[test]
fn thread_exit_releases_tracked_allocations() {
    // Thread creation and the test harness allocate a little as well, which is why the
    // assertions compare against a fraction of the tracked payload instead of zero.
    let tracked = signed(ALLOCATIONS * SIZE);

    for work in [
        allocate_without_release as fn(),
        allocate_release_and_allocate_again,
    ] {
        let before = LIVE_BYTES.load(Ordering::Relaxed);

        let (inside, after) = measure_thread(work);

        assert!(
            inside - before >= tracked,
            "tracked allocations were not live while the thread was running"
        );
        assert!(
            after - before < tracked / 10,
            "tracked allocations were not released at thread exit: {} bytes remain",
            after - before
        );
    }
}
