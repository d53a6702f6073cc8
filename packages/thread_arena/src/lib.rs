#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Thread-scoped allocations that are released in bulk.
//!
//! Every thread accumulates the allocations it makes through this crate and releases all of
//! them at once, either explicitly via [`release_current_thread_tracked()`] or automatically
//! when the thread exits. Individual allocations are never freed on their own.
//!
//! The core functionality includes:
//! - [`tracked_alloc()`] and [`tracked_zalloc()`] - Allocate uninitialized or zero-filled
//!   memory tracked by the calling thread
//! - [`release_current_thread_tracked()`] - Release everything the calling thread has tracked
//! - [`tracked_strdup()`] and [`tracked_sprintf!`] - Tracked string copies and formatting
//! - [`Arena`] - The owned building block behind the per-thread registry, with an API
//!   whose lifetimes the compiler can check
//!
//! # Tracked allocations
//!
//! The per-thread functions hand out raw pointers. They stay valid until the thread
//! releases its tracked allocations or exits, and dereferencing them is up to the caller.
//!
//! ```
//! use thread_arena::{current_thread_usage, release_current_thread_tracked, tracked_sprintf};
//!
//! for request_id in 0..3 {
//!     let message = tracked_sprintf!("handling request {request_id}");
//!
//!     // SAFETY: No release has happened on this thread since `message` was created.
//!     assert!(unsafe { message.as_str() }.starts_with("handling request"));
//!
//!     assert_eq!(current_thread_usage().allocations, 1);
//!
//!     // Everything tracked while handling the request goes away at once.
//!     release_current_thread_tracked();
//! }
//! ```
//!
//! Allocations left tracked when a thread exits are released by the thread-local storage
//! destructor of that thread:
//!
//! ```
//! use std::thread;
//!
//! use thread_arena::tracked_alloc;
//!
//! thread::spawn(|| {
//!     for _ in 0..1000 {
//!         _ = tracked_alloc(64);
//!     }
//!     // No explicit release needed.
//! })
//! .join()
//! .unwrap();
//! ```
//!
//! # Scoped arenas
//!
//! When the lifetime of the allocations matches a scope, use an [`Arena`] value. Its
//! allocations borrow the arena, so releasing requires that none of them are still in use.
//!
//! ```
//! use thread_arena::Arena;
//!
//! let mut arena = Arena::new();
//!
//! let name = arena.alloc_str("scratch");
//! let scratch = arena.alloc_zeroed(256);
//! scratch[0] = name.len() as u8;
//!
//! arena.release();
//! ```
//!
//! # Thread affinity
//!
//! Tracked allocations belong to the thread that made them. Another thread can neither see
//! nor release them, and the handles returned by this crate are neither [`Send`] nor
//! [`Sync`].
//!
//! # Allocation failure
//!
//! The infallible functions treat failure as fatal: exhaustion of the host allocator invokes
//! the standard allocation error handler, which aborts the process by default. Every
//! operation also has a `try_` variant that returns an [`Error`] instead. In both cases
//! nothing is tracked unless the allocation succeeded.
//!
//! # Logging
//!
//! Registry creation, explicit release and release at thread exit are reported through
//! [`tracing`] at `debug` and `trace` level. Individual allocations are not logged.

mod arena;
mod block;
mod error;
mod registry;
mod strings;

pub use arena::*;
pub use error::Error;
pub(crate) use error::{Result, fatal};
pub use registry::*;
pub use strings::*;
