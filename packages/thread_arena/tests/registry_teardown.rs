//! Tracked allocation from a thread-local destructor that runs after the registry of the
//! thread has been torn down.
//!
//! Thread-local destructors run in reverse order of registration. The slot below is
//! registered before the first tracked allocation registers the registry, so its destructor
//! runs last.

use std::sync::Mutex;
use std::thread;

use thread_arena::{
    Error, Usage, current_thread_usage, release_current_thread_tracked, tracked_alloc,
    try_tracked_alloc,
};

/// What the late destructor observed.
#[derive(Debug)]
struct Observed {
    allocation_refused: bool,
    usage_after_release: Usage,
}

static OBSERVED: Mutex<Option<Observed>> = Mutex::new(None);

struct LateDestructor;

impl Drop for LateDestructor {
    fn drop(&mut self) {
        let allocation = try_tracked_alloc(16);

        // Both must do nothing rather than resurrect or touch the registry.
        release_current_thread_tracked();
        let usage_after_release = current_thread_usage();

        *OBSERVED.lock().unwrap() = Some(Observed {
            allocation_refused: matches!(allocation, Err(Error::RegistryDestroyed)),
            usage_after_release,
        });
    }
}

thread_local! {
    static LATE: LateDestructor = const { LateDestructor };
}

#[test]
fn registry_is_unavailable_after_teardown() {
    thread::spawn(|| {
        LATE.with(|_| {});

        _ = tracked_alloc(32);
        assert_eq!(current_thread_usage().allocations, 1);
    })
    .join()
    .unwrap();

    let observed = OBSERVED
        .lock()
        .unwrap()
        .take()
        .expect("the late destructor ran before the thread was joined");

    assert!(observed.allocation_refused);
    assert_eq!(observed.usage_after_release.allocations, 0);
    assert_eq!(observed.usage_after_release.bytes, 0);
}
