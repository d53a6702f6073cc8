use std::alloc::{self, GlobalAlloc, Layout};
use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::NonNull;
use std::slice;

use crate::block::{self, Fill, Header};
use crate::{Result, fatal, strings};

/// The process-wide global allocator, as seen through [`GlobalAlloc`].
///
/// This is the default allocator of an [`Arena`] and the allocator behind the per-thread
/// registry used by [`tracked_alloc()`][crate::tracked_alloc]. It forwards to whatever
/// `#[global_allocator]` the program uses.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct HostAllocator;

impl HostAllocator {
    /// Creates a handle to the process-wide global allocator.
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self
    }
}

// SAFETY: We forward every call to the global allocator, which upholds the GlobalAlloc
// contract on our behalf.
unsafe impl GlobalAlloc for HostAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees to the global allocator.
        unsafe { alloc::alloc(layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees to the global allocator.
        unsafe { alloc::alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees to the global allocator.
        unsafe { alloc::dealloc(ptr, layout) }
    }
}

/// Number of live tracked allocations and the payload bytes they hold.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Usage {
    /// Number of tracked allocations that have not yet been released.
    pub allocations: usize,

    /// Sum of the requested payload sizes of those allocations.
    ///
    /// Block headers and alignment padding are not included.
    pub bytes: usize,
}

/// A set of allocations that are released together.
///
/// Every allocation made through an arena stays valid until the arena is
/// [released][Self::release] or dropped. There is no way to free a single allocation.
///
/// Each allocation is one block from the allocator `A`, holding a small header in front
/// of the payload. The arena links the blocks into a chain and walks that chain when
/// releasing.
///
/// The per-thread registry behind [`tracked_alloc()`][crate::tracked_alloc] is an arena
/// stored in thread-local storage. Use an `Arena` value directly when the lifetime of the
/// allocations matches a scope in your code, in which case the borrow checker can verify
/// that no payload outlives its release.
///
/// # Thread safety
///
/// An arena is bound to the thread that created it. It is neither [`Send`] nor [`Sync`].
///
/// # Examples
///
/// ```
/// use thread_arena::Arena;
///
/// let mut arena = Arena::new();
///
/// let zeroes = arena.alloc_zeroed(16);
/// assert!(zeroes.iter().all(|b| *b == 0));
///
/// let greeting = arena.alloc_fmt(format_args!("hello {}", "world"));
/// assert_eq!(greeting, "hello world");
///
/// assert_eq!(arena.len(), 2);
///
/// arena.release();
/// assert!(arena.is_empty());
/// ```
pub struct Arena<A: GlobalAlloc = HostAllocator> {
    head: Cell<Option<NonNull<Header>>>,
    usage: Cell<Usage>,
    allocator: A,
}

impl Arena {
    /// Creates an empty arena that allocates from the process-wide global allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_allocator(HostAllocator::new())
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: GlobalAlloc> Arena<A> {
    /// Creates an empty arena that allocates from the provided allocator.
    #[must_use]
    pub const fn with_allocator(allocator: A) -> Self {
        Self {
            head: Cell::new(None),
            usage: Cell::new(Usage {
                allocations: 0,
                bytes: 0,
            }),
            allocator,
        }
    }

    /// The allocator the arena obtains its blocks from.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Allocates `size` bytes with uninitialized contents.
    ///
    /// The payload is aligned to 16 bytes. A `size` of zero is valid and still produces a
    /// distinct allocation.
    ///
    /// # Panics
    ///
    /// Panics if `size` is too large to form a valid memory layout. If the allocator
    /// cannot satisfy the request, the standard allocation error handler is invoked,
    /// which aborts the process by default.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a new block that no other reference points to"
    )]
    pub fn alloc(&self, size: usize) -> &mut [MaybeUninit<u8>] {
        self.try_alloc(size).unwrap_or_else(|error| fatal(error))
    }

    /// Allocates `size` bytes with uninitialized contents, returning an error instead of
    /// terminating if the allocation cannot be made.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeOverflow`][crate::Error::SizeOverflow] if `size` is too large to
    /// form a valid memory layout and [`Error::AllocationFailed`][crate::Error::AllocationFailed]
    /// if the allocator cannot satisfy the request. The arena is unchanged in both cases.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a new block that no other reference points to"
    )]
    pub fn try_alloc(&self, size: usize) -> Result<&mut [MaybeUninit<u8>]> {
        let payload = self.alloc_raw(size, Fill::Uninit)?;

        // SAFETY: The payload is a new region that nothing else references. It stays valid
        // while `self` is borrowed because releasing requires `&mut self` or ownership.
        Ok(unsafe {
            slice::from_raw_parts_mut(payload.cast::<MaybeUninit<u8>>().as_ptr(), payload.len())
        })
    }

    /// Allocates `size` zero-filled bytes.
    ///
    /// # Panics
    ///
    /// Same conditions as [`alloc()`][Self::alloc].
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a new block that no other reference points to"
    )]
    pub fn alloc_zeroed(&self, size: usize) -> &mut [u8] {
        self.try_alloc_zeroed(size).unwrap_or_else(|error| fatal(error))
    }

    /// Allocates `size` zero-filled bytes, returning an error instead of terminating if the
    /// allocation cannot be made.
    ///
    /// # Errors
    ///
    /// Same conditions as [`try_alloc()`][Self::try_alloc].
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a new block that no other reference points to"
    )]
    pub fn try_alloc_zeroed(&self, size: usize) -> Result<&mut [u8]> {
        let mut payload = self.alloc_raw(size, Fill::Zeroed)?;

        // SAFETY: The payload is a new, zero-initialized region that nothing else references.
        // It stays valid while `self` is borrowed because releasing requires `&mut self`.
        Ok(unsafe { payload.as_mut() })
    }

    /// Copies `text` into the arena.
    ///
    /// A NUL terminator is stored right behind the returned string, so the pointer of the
    /// result can also be handed to C code expecting a NUL-terminated string (as long as
    /// `text` itself contains no NUL).
    ///
    /// # Panics
    ///
    /// Same conditions as [`alloc()`][Self::alloc].
    pub fn alloc_str(&self, text: &str) -> &str {
        let tracked = strings::duplicate(self, text).unwrap_or_else(|error| fatal(error));

        // SAFETY: The block is owned by this arena and stays valid while `self` is borrowed.
        unsafe { tracked.as_str() }
    }

    /// Formats `args` into the arena, followed by a NUL terminator.
    ///
    /// Short results are rendered into a stack buffer first and then copied. Longer results
    /// are rendered a second time directly into an allocation of the exact required size.
    ///
    /// # Panics
    ///
    /// Panics if a formatting trait implementation returns an error. Otherwise, same
    /// conditions as [`alloc()`][Self::alloc].
    pub fn alloc_fmt(&self, args: fmt::Arguments<'_>) -> &str {
        let tracked = strings::format(self, args).unwrap_or_else(|error| fatal(error));

        // SAFETY: The block is owned by this arena and stays valid while `self` is borrowed.
        unsafe { tracked.as_str() }
    }

    /// Releases every allocation made through this arena and returns what was released.
    ///
    /// The arena is empty afterwards and can be used for new allocations. Releasing an
    /// empty arena does nothing.
    pub fn release(&mut self) -> Usage {
        self.release_blocks()
    }

    /// Number of live allocations and the payload bytes they hold.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage.get()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.usage.get().allocations
    }

    /// Whether the arena holds no live allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Allocates a new block and links it at the head of the chain.
    ///
    /// The block is linked only after the allocator has succeeded.
    pub(crate) fn alloc_raw(&self, size: usize, fill: Fill) -> Result<NonNull<[u8]>> {
        Ok(self.alloc_unlinked(size, fill)?.link())
    }

    /// Allocates a new block that is not yet part of the chain.
    ///
    /// A release of the arena does not touch the block, so it can be filled by code that may
    /// itself release the arena. The block joins the chain when [`Unlinked::link()`] is
    /// called and goes back to the allocator if the guard is dropped instead.
    pub(crate) fn alloc_unlinked(&self, size: usize, fill: Fill) -> Result<Unlinked<'_, A>> {
        let block = block::allocate(&self.allocator, size, fill)?;

        Ok(Unlinked { arena: self, block })
    }

    fn link_block(&self, block: NonNull<Header>) -> NonNull<[u8]> {
        // SAFETY: The block is live and not yet part of any chain.
        unsafe { block::set_next(block, self.head.get()) };
        self.head.set(Some(block));

        // SAFETY: The block is live; it is now owned by the chain.
        let payload = unsafe { block::payload(block) };

        let usage = self.usage.get();
        self.usage.set(Usage {
            allocations: usage.allocations.saturating_add(1),
            bytes: usage.bytes.saturating_add(payload.len()),
        });

        payload
    }

    /// Walks the chain from the head, returning every block to the allocator, and leaves
    /// the arena empty.
    ///
    /// Takes `&self` so the thread registry can release through a shared reference. Callers
    /// must ensure that no reference into any payload is alive: the public API does this by
    /// requiring `&mut self`, the thread registry never hands out references.
    pub(crate) fn release_blocks(&self) -> Usage {
        let released = self.usage.take();
        let mut cursor = self.head.take();

        while let Some(block) = cursor {
            // SAFETY: Every block in the chain came from our allocator. The chain was detached
            // from `head` above, so each block is released exactly once.
            cursor = unsafe { block::deallocate(&self.allocator, block) };
        }

        released
    }
}

/// A block of an [`Arena`] that has been allocated but not yet linked into its chain.
///
/// Dropping the guard returns the block to the allocator.
pub(crate) struct Unlinked<'a, A: GlobalAlloc> {
    arena: &'a Arena<A>,
    block: NonNull<Header>,
}

impl<A: GlobalAlloc> Unlinked<'_, A> {
    /// The payload region of the block.
    pub(crate) fn payload(&self) -> NonNull<[u8]> {
        // SAFETY: The guard owns the block, so it is still live.
        unsafe { block::payload(self.block) }
    }

    /// Links the block at the head of the arena's current chain and hands back its payload.
    pub(crate) fn link(self) -> NonNull<[u8]> {
        let this = ManuallyDrop::new(self);

        this.arena.link_block(this.block)
    }
}

impl<A: GlobalAlloc> Drop for Unlinked<'_, A> {
    fn drop(&mut self) {
        // SAFETY: The guard owns the block and nothing links to it. `link()` skips this drop
        // once the chain owns the block.
        unsafe { block::deallocate(&self.arena.allocator, self.block) };
    }
}

impl<A: GlobalAlloc> Drop for Arena<A> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

impl<A: GlobalAlloc> fmt::Debug for Arena<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("usage", &self.usage.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::System;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;

    assert_not_impl_any!(Arena: Send, Sync);
    assert_impl_all!(HostAllocator: Send, Sync);

    /// Counts blocks obtained from and returned to the system allocator.
    #[derive(Clone, Debug, Default)]
    struct CountingAllocator {
        live: Rc<Cell<isize>>,
        total: Rc<Cell<usize>>,
    }

    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.live.set(self.live.get() + 1);
            self.total.set(self.total.get() + 1);
            unsafe { System.alloc(layout) }
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            self.live.set(self.live.get() + 1);
            self.total.set(self.total.get() + 1);
            unsafe { System.alloc_zeroed(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.live.set(self.live.get() - 1);
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    /// Refuses every request.
    #[derive(Debug)]
    struct ExhaustedAllocator;

    unsafe impl GlobalAlloc for ExhaustedAllocator {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            std::ptr::null_mut()
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            unreachable!("nothing was ever allocated");
        }
    }

    #[test]
    fn smoke_test() {
        let mut arena = Arena::new();

        assert!(arena.is_empty());
        assert_eq!(arena.len(), 0);

        let a = arena.alloc(10);
        assert_eq!(a.len(), 10);
        let b = arena.alloc_zeroed(20);
        assert_eq!(b.len(), 20);

        assert!(!arena.is_empty());
        assert_eq!(
            arena.usage(),
            Usage {
                allocations: 2,
                bytes: 30
            }
        );

        let released = arena.release();
        assert_eq!(released.allocations, 2);
        assert_eq!(released.bytes, 30);
        assert!(arena.is_empty());
        assert_eq!(arena.usage(), Usage::default());
    }

    #[test]
    fn release_returns_every_block_to_allocator() {
        let allocator = CountingAllocator::default();
        let mut arena = Arena::with_allocator(allocator.clone());

        for size in 0..50 {
            arena.alloc(size);
            arena.alloc_zeroed(size);
        }

        assert_eq!(allocator.live.get(), 100);

        arena.release();
        assert_eq!(allocator.live.get(), 0);
        assert_eq!(allocator.total.get(), 100);
    }

    #[test]
    fn release_twice_is_noop() {
        let allocator = CountingAllocator::default();
        let mut arena = Arena::with_allocator(allocator.clone());

        arena.alloc(64);
        arena.release();

        let released = arena.release();
        assert_eq!(released, Usage::default());
        assert_eq!(allocator.live.get(), 0);
        assert_eq!(allocator.total.get(), 1);
    }

    #[test]
    fn release_of_empty_arena_is_noop() {
        let allocator = CountingAllocator::default();
        let mut arena = Arena::with_allocator(allocator.clone());

        assert_eq!(arena.release(), Usage::default());
        assert_eq!(allocator.total.get(), 0);
    }

    #[test]
    fn drop_releases_remaining_blocks() {
        let allocator = CountingAllocator::default();

        {
            let arena = Arena::with_allocator(allocator.clone());
            arena.alloc(8);
            arena.alloc_str("leftover");
            assert_eq!(allocator.live.get(), 2);
        }

        assert_eq!(allocator.live.get(), 0);
    }

    #[test]
    fn allocations_after_release_are_independent() {
        let mut arena = Arena::new();

        arena.alloc_zeroed(32).fill(0xAA);
        arena.release();

        let fresh = arena.alloc_zeroed(32);
        assert!(fresh.iter().all(|b| *b == 0));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn zero_sized_allocations_are_distinct() {
        let arena = Arena::new();

        let first = arena.alloc(0).as_ptr();
        let second = arena.alloc(0).as_ptr();

        assert_ne!(first, second);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn zeroed_allocations_are_zero_for_many_sizes() {
        let arena = Arena::new();

        for size in [0, 1, 15, 16, 17, 255, 4096, 65_537] {
            let bytes = arena.alloc_zeroed(size);
            assert_eq!(bytes.len(), size);
            assert!(bytes.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn payloads_are_aligned() {
        let arena = Arena::new();

        for size in [0, 1, 3, 100] {
            let ptr = arena.alloc(size).as_ptr();
            assert_eq!(ptr as usize % block::PAYLOAD_ALIGN, 0);
        }
    }

    #[test]
    fn payloads_can_be_written_independently() {
        let arena = Arena::new();

        let a = arena.alloc_zeroed(4);
        let b = arena.alloc_zeroed(4);

        a.copy_from_slice(&[1, 2, 3, 4]);
        b.copy_from_slice(&[5, 6, 7, 8]);

        assert_eq!(a, &[1, 2, 3, 4]);
        assert_eq!(b, &[5, 6, 7, 8]);
    }

    #[test]
    fn oversized_request_leaves_arena_unchanged() {
        let arena = Arena::new();
        arena.alloc(1);

        let result = arena.try_alloc(usize::MAX);

        assert!(matches!(result, Err(Error::SizeOverflow { .. })));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn exhausted_allocator_leaves_arena_unchanged() {
        let arena = Arena::with_allocator(ExhaustedAllocator);

        let result = arena.try_alloc_zeroed(128);

        assert!(matches!(result, Err(Error::AllocationFailed { layout }) if layout.size() >= 128));
        assert!(arena.is_empty());
        assert_eq!(arena.usage(), Usage::default());
    }

    #[test]
    #[should_panic(expected = "maximum supported block size")]
    fn alloc_panics_on_oversized_request() {
        let arena = Arena::new();

        arena.alloc(usize::MAX);
    }

    #[test]
    fn strings_are_copied_into_arena() {
        let arena = Arena::new();
        let original = String::from("copy me");

        let copy = arena.alloc_str(&original);

        assert_eq!(copy, "copy me");
        assert_ne!(copy.as_ptr(), original.as_ptr());
    }

    #[test]
    fn debug_output_includes_usage() {
        let arena = Arena::new();
        arena.alloc(5);

        let output = format!("{arena:?}");

        assert!(output.contains("allocations: 1"));
        assert!(output.contains("bytes: 5"));
    }
}
