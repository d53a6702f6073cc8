use std::alloc::{Layout, handle_alloc_error};

use thiserror::Error;

/// Errors that can occur when making a tracked allocation.
///
/// The infallible entry points ([`tracked_alloc()`][crate::tracked_alloc],
/// [`Arena::alloc()`][crate::Arena::alloc] and friends) treat every one of these as fatal.
/// Use the `try_` variants to observe them instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested payload size cannot be combined with the block header into a valid
    /// memory layout.
    #[error("a tracked allocation of {size} bytes exceeds the maximum supported block size")]
    SizeOverflow {
        /// The payload size that was requested.
        size: usize,
    },

    /// The host allocator could not satisfy the request.
    #[error(
        "the host allocator could not provide {} bytes for a tracked allocation",
        .layout.size()
    )]
    AllocationFailed {
        /// The full block layout (header and payload) requested from the host allocator.
        layout: Layout,
    },

    /// A formatting trait implementation returned an error, or rendered a different length
    /// when the arguments were formatted a second time.
    #[error("a formatting trait implementation returned an error")]
    Format,

    /// The calling thread is exiting and its registry has already been torn down.
    #[error("the tracked allocation registry of this thread has already been torn down")]
    RegistryDestroyed,
}

/// A specialized `Result` type for tracked allocation, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Terminates the current operation for an error surfaced by an infallible entry point.
///
/// Allocation failure goes through the standard allocation error handler, which aborts
/// the process by default. Everything else is a caller bug and panics.
#[cold]
#[cfg_attr(test, mutants::skip)] // Every mutation diverges the same way.
pub(crate) fn fatal(error: Error) -> ! {
    match error {
        Error::AllocationFailed { layout } => handle_alloc_error(layout),
        other => panic!("{other}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn size_overflow_names_the_size() {
        let error = Error::SizeOverflow { size: 12345 };

        assert!(error.to_string().contains("12345"));
    }

    #[test]
    fn allocation_failed_names_the_block_size() {
        let layout = Layout::from_size_align(4096, 16).unwrap();
        let error = Error::AllocationFailed { layout };

        assert!(error.to_string().contains("4096"));
    }

    #[test]
    #[should_panic(expected = "formatting trait implementation")]
    fn fatal_panics_for_format_error() {
        fatal(Error::Format);
    }

    #[test]
    #[should_panic(expected = "torn down")]
    fn fatal_panics_for_destroyed_registry() {
        fatal(Error::RegistryDestroyed);
    }
}
