//! The per-thread registry of tracked allocations.

use std::cell::OnceCell;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::block::Fill;
use crate::{Arena, Error, Result, Usage, fatal};

thread_local! {
    // Populated by the first tracked allocation of the thread. The slot destructor releases
    // whatever is still tracked when the thread exits, then frees the registry itself.
    static REGISTRY: OnceCell<ThreadRegistry> = const { OnceCell::new() };
}

/// The tracked allocations of one thread.
#[derive(Debug)]
struct ThreadRegistry {
    arena: Arena,
}

impl ThreadRegistry {
    fn new() -> Self {
        debug!("created tracked allocation registry for thread");

        Self {
            arena: Arena::new(),
        }
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let released = self.arena.release();

        debug!(
            allocations = released.allocations,
            bytes = released.bytes,
            "released tracked allocations at thread exit"
        );
    }
}

/// Runs `f` with the registry of the calling thread, creating the registry if this is the
/// first tracked allocation of the thread.
pub(crate) fn with_registry<R>(f: impl FnOnce(&Arena) -> Result<R>) -> Result<R> {
    REGISTRY
        .try_with(|slot| f(&slot.get_or_init(ThreadRegistry::new).arena))
        .map_err(|_access| Error::RegistryDestroyed)?
}

/// Runs `f` with the registry of the calling thread if one exists and is not yet torn down.
fn with_existing_registry<R>(f: impl FnOnce(&Arena) -> R) -> Option<R> {
    REGISTRY
        .try_with(|slot| slot.get().map(|registry| f(&registry.arena)))
        .ok()
        .flatten()
}

/// Allocates `size` bytes with uninitialized contents, tracked by the calling thread.
///
/// The allocation stays valid until the thread calls [`release_current_thread_tracked()`]
/// or exits, whichever comes first. It must not be freed in any other way. The payload is
/// aligned to 16 bytes, and a `size` of zero still produces a distinct allocation.
///
/// The returned pointer is not tied to any borrow, so the compiler cannot verify that it is
/// not used after release. Use an [`Arena`] value if you need that guarantee.
///
/// # Panics
///
/// Panics if `size` is too large to form a valid memory layout or if called while the
/// calling thread is exiting and its registry has already been torn down. If the host
/// allocator cannot satisfy the request, the standard allocation error handler is invoked,
/// which aborts the process by default.
///
/// # Examples
///
/// ```
/// use thread_arena::{release_current_thread_tracked, tracked_alloc};
///
/// let buffer = tracked_alloc(64);
/// assert_eq!(buffer.len(), 64);
///
/// // SAFETY: The buffer is live and 64 bytes long.
/// unsafe { buffer.cast::<u8>().write_bytes(0x2A, 64) };
///
/// release_current_thread_tracked();
/// ```
#[must_use]
pub fn tracked_alloc(size: usize) -> NonNull<[u8]> {
    try_tracked_alloc(size).unwrap_or_else(|error| fatal(error))
}

/// Allocates `size` bytes with uninitialized contents, tracked by the calling thread,
/// returning an error instead of terminating if the allocation cannot be made.
///
/// # Errors
///
/// Returns [`Error::SizeOverflow`] if `size` is too large to form a valid memory layout,
/// [`Error::AllocationFailed`] if the host allocator cannot satisfy the request and
/// [`Error::RegistryDestroyed`] if the calling thread's registry has already been torn down.
/// Nothing is tracked in any of these cases.
pub fn try_tracked_alloc(size: usize) -> Result<NonNull<[u8]>> {
    with_registry(|arena| arena.alloc_raw(size, Fill::Uninit))
}

/// Allocates `size` zero-filled bytes, tracked by the calling thread.
///
/// Apart from the contents, this behaves like [`tracked_alloc()`].
///
/// # Panics
///
/// Same conditions as [`tracked_alloc()`].
///
/// # Examples
///
/// ```
/// use thread_arena::tracked_zalloc;
///
/// let zeroes = tracked_zalloc(32);
///
/// // SAFETY: No release has happened on this thread since the allocation was made.
/// let bytes = unsafe { zeroes.as_ref() };
/// assert!(bytes.iter().all(|b| *b == 0));
/// ```
#[must_use]
pub fn tracked_zalloc(size: usize) -> NonNull<[u8]> {
    try_tracked_zalloc(size).unwrap_or_else(|error| fatal(error))
}

/// Allocates `size` zero-filled bytes, tracked by the calling thread, returning an error
/// instead of terminating if the allocation cannot be made.
///
/// # Errors
///
/// Same conditions as [`try_tracked_alloc()`].
pub fn try_tracked_zalloc(size: usize) -> Result<NonNull<[u8]>> {
    with_registry(|arena| arena.alloc_raw(size, Fill::Zeroed))
}

/// Releases every allocation tracked by the calling thread so far.
///
/// All pointers previously returned to this thread by [`tracked_alloc()`],
/// [`tracked_zalloc()`], [`tracked_strdup()`][crate::tracked_strdup] and
/// [`tracked_format()`][crate::tracked_format] become invalid. Allocations tracked by other
/// threads are not affected.
///
/// Calling this on a thread that has nothing tracked, including calling it twice in a row,
/// does nothing.
pub fn release_current_thread_tracked() {
    if let Some(released) = with_existing_registry(Arena::release_blocks) {
        trace!(
            allocations = released.allocations,
            bytes = released.bytes,
            "released tracked allocations"
        );
    }
}

/// Number of allocations currently tracked by the calling thread and the payload bytes they
/// hold.
///
/// Does not create a registry for the thread if it has not made any tracked allocation yet.
#[must_use]
pub fn current_thread_usage() -> Usage {
    with_existing_registry(Arena::usage).unwrap_or_default()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::thread;

    use super::*;

    // Each test releases what it tracks, so the registry is empty between tests even when
    // the harness runs them on a shared thread.

    #[test]
    fn usage_is_empty_before_first_allocation() {
        assert_eq!(current_thread_usage(), Usage::default());

        release_current_thread_tracked();
        assert_eq!(current_thread_usage(), Usage::default());
    }

    #[test]
    fn allocations_are_counted_until_released() {
        _ = tracked_alloc(10);
        _ = tracked_zalloc(20);

        assert_eq!(
            current_thread_usage(),
            Usage {
                allocations: 2,
                bytes: 30
            }
        );

        release_current_thread_tracked();
        assert_eq!(current_thread_usage(), Usage::default());

        release_current_thread_tracked();
        assert_eq!(current_thread_usage(), Usage::default());
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        for size in [0, 1, 100, 10_000] {
            let zeroes = tracked_zalloc(size);
            let bytes = unsafe { zeroes.as_ref() };

            assert_eq!(bytes.len(), size);
            assert!(bytes.iter().all(|b| *b == 0));
        }

        release_current_thread_tracked();
    }

    #[test]
    fn zero_sized_allocations_are_distinct() {
        let first = tracked_alloc(0);
        let second = tracked_alloc(0);

        assert_ne!(first.cast::<u8>(), second.cast::<u8>());

        release_current_thread_tracked();
    }

    #[test]
    fn failed_allocation_is_not_tracked() {
        _ = tracked_alloc(1);

        let result = try_tracked_alloc(usize::MAX);

        assert!(matches!(result, Err(Error::SizeOverflow { .. })));
        assert_eq!(current_thread_usage().allocations, 1);

        release_current_thread_tracked();
    }

    #[test]
    fn allocations_after_release_work() {
        for _ in 0..3 {
            let block = tracked_zalloc(16);
            unsafe { block.cast::<u8>().write_bytes(0xFF, 16) };
            assert_eq!(current_thread_usage().allocations, 1);

            release_current_thread_tracked();
        }
    }

    #[test]
    fn other_threads_do_not_see_allocations() {
        _ = tracked_alloc(128);

        thread::spawn(|| {
            assert_eq!(current_thread_usage(), Usage::default());

            _ = tracked_alloc(64);
            release_current_thread_tracked();
        })
        .join()
        .unwrap();

        assert_eq!(
            current_thread_usage(),
            Usage {
                allocations: 1,
                bytes: 128
            }
        );

        release_current_thread_tracked();
    }
}
