//! Tracked string duplication and formatting.

use std::alloc::GlobalAlloc;
use std::ffi::c_char;
use std::fmt::{self, Write as _};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::{slice, str};

use crate::block::Fill;
use crate::registry::with_registry;
use crate::{Arena, Error, Result, fatal};

/// Size of the stack buffer used to render short formatted strings, terminator included.
const FAST_PATH_CAPACITY: usize = 100;

/// Tracked UTF-8 text followed by a NUL terminator.
///
/// Returned by [`tracked_strdup()`] and [`tracked_format()`]. The handle is a plain pointer
/// and length: copying it does not copy the text, and it does not keep the text alive. The
/// text is released together with every other tracked allocation of the thread that
/// created it.
///
/// # Examples
///
/// ```
/// use thread_arena::{release_current_thread_tracked, tracked_strdup};
///
/// let name = tracked_strdup("Ferris");
///
/// // SAFETY: No release has happened on this thread since `name` was created.
/// assert_eq!(unsafe { name.as_str() }, "Ferris");
///
/// release_current_thread_tracked();
/// // `name` must not be dereferenced any more.
/// ```
#[derive(Clone, Copy, Debug)]
pub struct TrackedStr {
    ptr: NonNull<u8>,
    len: usize,
}

impl TrackedStr {
    /// Length of the text in bytes, not counting the terminator.
    #[must_use]
    pub fn len(self) -> usize {
        self.len
    }

    /// Whether the text is empty. The terminator is still present.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Pointer to the first byte of the text.
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.ptr.as_ptr().cast_const()
    }

    /// Pointer to the text as a NUL-terminated C string.
    ///
    /// C code will see the text up to its first NUL byte, which is the terminator unless
    /// the text itself contains a NUL.
    #[must_use]
    pub fn as_c_ptr(self) -> *const c_char {
        self.as_ptr().cast()
    }

    /// Borrows the text.
    ///
    /// # Safety
    ///
    /// The allocation must not have been released since this handle was created, and it must
    /// not be released while the returned reference is in use.
    #[must_use]
    pub unsafe fn as_str<'a>(self) -> &'a str {
        // SAFETY: Forwarding guarantee from the caller that the block is still live.
        let bytes = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) };

        // SAFETY: The block was filled by copying from a `str` or by a formatter writing
        // `str` fragments, so it always holds valid UTF-8.
        unsafe { str::from_utf8_unchecked(bytes) }
    }

    /// Borrows the text including its NUL terminator.
    ///
    /// # Safety
    ///
    /// Same requirements as [`as_str()`][Self::as_str].
    #[must_use]
    pub unsafe fn as_bytes_with_nul<'a>(self) -> &'a [u8] {
        let len_with_nul = self
            .len
            .checked_add(1)
            .expect("the terminator fit into the allocation, so this cannot overflow");

        // SAFETY: Forwarding guarantee from the caller that the block is still live. The
        // block holds `len` bytes of text followed by the terminator.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len_with_nul) }
    }
}

/// Copies `text` into a new tracked allocation owned by the calling thread, followed by a
/// NUL terminator.
///
/// # Panics
///
/// Panics if called while the calling thread is exiting and its registry has already been
/// torn down. If the host allocator cannot satisfy the request, the standard allocation
/// error handler is invoked, which aborts the process by default.
///
/// # Examples
///
/// ```
/// use thread_arena::tracked_strdup;
///
/// let original = String::from("hello");
/// let copy = tracked_strdup(&original);
///
/// assert_ne!(copy.as_ptr(), original.as_ptr());
///
/// // SAFETY: No release has happened on this thread since `copy` was created.
/// let bytes = unsafe { copy.as_bytes_with_nul() };
/// assert_eq!(bytes, b"hello\0");
/// ```
#[must_use]
pub fn tracked_strdup(text: &str) -> TrackedStr {
    try_tracked_strdup(text).unwrap_or_else(|error| fatal(error))
}

/// Copies `text` into a new tracked allocation owned by the calling thread, returning an
/// error instead of terminating if the allocation cannot be made.
///
/// # Errors
///
/// Returns [`Error::AllocationFailed`] if the host allocator cannot satisfy the request and
/// [`Error::RegistryDestroyed`] if the calling thread's registry has already been torn down.
pub fn try_tracked_strdup(text: &str) -> Result<TrackedStr> {
    with_registry(|arena| duplicate(arena, text))
}

/// Renders `args` into a new tracked allocation owned by the calling thread, followed by a
/// NUL terminator.
///
/// Usually called through the [`tracked_sprintf!`][crate::tracked_sprintf] macro.
///
/// # Panics
///
/// Panics if a formatting trait implementation returns an error. Otherwise, same conditions
/// as [`tracked_strdup()`].
#[must_use]
pub fn tracked_format(args: fmt::Arguments<'_>) -> TrackedStr {
    try_tracked_format(args).unwrap_or_else(|error| fatal(error))
}

/// Renders `args` into a new tracked allocation owned by the calling thread, returning an
/// error instead of terminating if formatting or allocation fails.
///
/// # Errors
///
/// Returns [`Error::Format`] if a formatting trait implementation returns an error or
/// renders inconsistently. Otherwise, same conditions as [`try_tracked_strdup()`].
pub fn try_tracked_format(args: fmt::Arguments<'_>) -> Result<TrackedStr> {
    with_registry(|arena| format(arena, args))
}

/// Formats a string into a tracked allocation owned by the calling thread.
///
/// Accepts the same syntax as [`format!`] and returns a [`TrackedStr`].
///
/// # Examples
///
/// ```
/// use thread_arena::tracked_sprintf;
///
/// let text = tracked_sprintf!("{}-{}", 7, "x");
///
/// // SAFETY: No release has happened on this thread since `text` was created.
/// assert_eq!(unsafe { text.as_str() }, "7-x");
/// ```
#[macro_export]
macro_rules! tracked_sprintf {
    ($($arg:tt)*) => {
        $crate::tracked_format(::std::format_args!($($arg)*))
    };
}

/// Copies `text` plus a terminator into a new block of `arena`.
pub(crate) fn duplicate<A: GlobalAlloc>(arena: &Arena<A>, text: &str) -> Result<TrackedStr> {
    let len = text.len();
    let size = len
        .checked_add(1)
        .ok_or(Error::SizeOverflow { size: len })?;

    let data = arena.alloc_raw(size, Fill::Uninit)?.cast::<u8>();

    // SAFETY: The block is new and holds `len + 1` bytes, so it cannot overlap `text` and
    // has room for all of it.
    unsafe {
        ptr::copy_nonoverlapping(text.as_ptr(), data.as_ptr(), len);
    }

    // SAFETY: Index `len` is the last byte of the `len + 1` byte payload.
    unsafe {
        data.add(len).write(0);
    }

    Ok(TrackedStr { ptr: data, len })
}

/// Renders `args` plus a terminator into a new block of `arena`.
///
/// The first pass goes into a stack buffer and measures the full length. Results that fit
/// are copied from there; longer results are rendered again, directly into a block of the
/// exact size reported by the first pass.
pub(crate) fn format<A: GlobalAlloc>(
    arena: &Arena<A>,
    args: fmt::Arguments<'_>,
) -> Result<TrackedStr> {
    let mut measured = StackBuffer::new();
    measured.write_fmt(args).map_err(|_formatter| Error::Format)?;

    if let Some(text) = measured.as_str() {
        return duplicate(arena, text);
    }

    let len = measured.required;
    let size = len
        .checked_add(1)
        .ok_or(Error::SizeOverflow { size: len })?;

    // The block stays out of the chain while user formatting code runs, so a release from
    // inside that code cannot free it, and a failed pass leaves nothing tracked.
    let block = arena.alloc_unlinked(size, Fill::Uninit)?;
    let payload = block.payload();

    // SAFETY: The block is new and nothing else references it. Viewing it as
    // `MaybeUninit<u8>` makes no claim about its contents.
    let target = unsafe {
        slice::from_raw_parts_mut(payload.cast::<MaybeUninit<u8>>().as_ptr(), payload.len())
    };

    let mut writer = SliceWriter {
        target,
        written: 0,
    };
    writer.write_fmt(args).map_err(|_formatter| Error::Format)?;

    // A formatter that renders differently on the second pass leaves a gap or overruns.
    if writer.written != len {
        return Err(Error::Format);
    }

    writer
        .target
        .get_mut(len)
        .expect("payload holds the text plus one terminator byte")
        .write(0);

    Ok(TrackedStr {
        ptr: block.link().cast::<u8>(),
        len,
    })
}

/// Formatting target that keeps output up to its capacity and counts the full length.
struct StackBuffer {
    bytes: [u8; FAST_PATH_CAPACITY],
    required: usize,
}

impl StackBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; FAST_PATH_CAPACITY],
            required: 0,
        }
    }

    /// The rendered text, if it fits together with a terminator.
    fn as_str(&self) -> Option<&str> {
        if self.required >= FAST_PATH_CAPACITY {
            return None;
        }

        self.bytes
            .get(..self.required)
            .and_then(|bytes| str::from_utf8(bytes).ok())
    }
}

impl fmt::Write for StackBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let start = self.required;
        let end = start.checked_add(s.len()).ok_or(fmt::Error)?;

        // Once a fragment does not fit, no later one will either; only the length matters.
        if let Some(target) = self.bytes.get_mut(start..end) {
            target.copy_from_slice(s.as_bytes());
        }

        self.required = end;
        Ok(())
    }
}

/// Formatting target writing into a tracked block sized by a previous measuring pass.
struct SliceWriter<'a> {
    target: &'a mut [MaybeUninit<u8>],
    written: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.written.checked_add(s.len()).ok_or(fmt::Error)?;
        let target = self.target.get_mut(self.written..end).ok_or(fmt::Error)?;

        for (slot, byte) in target.iter_mut().zip(s.as_bytes()) {
            slot.write(*byte);
        }

        self.written = end;
        Ok(())
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
    use std::alloc::{Layout, System};
    use std::cell::Cell;
    use std::fmt::Write as _;
    use std::rc::Rc;

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::Usage;

    assert_not_impl_any!(TrackedStr: Send, Sync);

    /// Renders a different length every time it is formatted.
    struct Growing(Cell<usize>);

    impl fmt::Display for Growing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let count = self.0.get();
            self.0.set(count + 1);

            for _ in 0..(FAST_PATH_CAPACITY + count) {
                f.write_str("g")?;
            }

            Ok(())
        }
    }

    /// Renders 200 bytes every time but reports an error on the second pass.
    struct FailsOnSecondPass(Cell<usize>);

    impl fmt::Display for FailsOnSecondPass {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let count = self.0.get() + 1;
            self.0.set(count);

            f.write_str(&"e".repeat(200))?;

            if count == 2 { Err(fmt::Error) } else { Ok(()) }
        }
    }

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

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.live.set(self.live.get() - 1);
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    /// Always fails to render.
    struct Broken;

    impl fmt::Display for Broken {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn duplicate_appends_terminator() {
        let arena = Arena::new();

        let copy = duplicate(&arena, "abc").unwrap();

        assert_eq!(copy.len(), 3);
        assert_eq!(unsafe { copy.as_bytes_with_nul() }, b"abc\0");
        assert_eq!(unsafe { copy.as_str() }, "abc");
    }

    #[test]
    fn duplicate_of_empty_string_is_just_terminator() {
        let arena = Arena::new();

        let copy = duplicate(&arena, "").unwrap();

        assert!(copy.is_empty());
        assert_eq!(unsafe { copy.as_bytes_with_nul() }, b"\0");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn duplicate_preserves_multibyte_text() {
        let arena = Arena::new();

        let copy = duplicate(&arena, "žluťoučký kůň 🦀").unwrap();

        assert_eq!(unsafe { copy.as_str() }, "žluťoučký kůň 🦀");
    }

    #[test]
    fn c_pointer_reads_as_c_string() {
        let arena = Arena::new();

        let copy = duplicate(&arena, "from C").unwrap();

        let c_str = unsafe { std::ffi::CStr::from_ptr(copy.as_c_ptr()) };
        assert_eq!(c_str.to_str().unwrap(), "from C");
    }

    #[test]
    fn short_format_uses_single_allocation() {
        let arena = Arena::new();

        let text = format(&arena, format_args!("{}-{}", 7, "x")).unwrap();

        assert_eq!(unsafe { text.as_str() }, "7-x");
        assert_eq!(
            arena.usage(),
            Usage {
                allocations: 1,
                bytes: 4
            }
        );
    }

    #[test]
    fn long_format_is_not_truncated() {
        let arena = Arena::new();
        let long = "y".repeat(500);

        let text = format(&arena, format_args!("[{long}]")).unwrap();

        assert_eq!(text.len(), 502);
        let rendered = unsafe { text.as_str() };
        assert!(rendered.starts_with("[y"));
        assert!(rendered.ends_with("y]"));
        assert_eq!(unsafe { text.as_bytes_with_nul() }[502], 0);
        assert_eq!(
            arena.usage(),
            Usage {
                allocations: 1,
                bytes: 503
            }
        );
    }

    #[test]
    fn format_at_fast_path_boundary() {
        let arena = Arena::new();

        // 99 bytes plus the terminator still fit the stack buffer.
        let fits = "a".repeat(FAST_PATH_CAPACITY - 1);
        let text = format(&arena, format_args!("{fits}")).unwrap();
        assert_eq!(unsafe { text.as_str() }, fits);

        // 100 bytes plus the terminator take the measured path.
        let spills = "b".repeat(FAST_PATH_CAPACITY);
        let text = format(&arena, format_args!("{spills}")).unwrap();
        assert_eq!(unsafe { text.as_str() }, spills);
    }

    #[test]
    fn formatter_error_is_reported() {
        let arena = Arena::new();

        let result = format(&arena, format_args!("{}", Broken));

        assert!(matches!(result, Err(Error::Format)));
        assert!(arena.is_empty());
    }

    #[test]
    fn inconsistent_formatter_is_reported() {
        let arena = Arena::new();
        let growing = Growing(Cell::new(1));

        let result = format(&arena, format_args!("{}", growing));

        assert!(matches!(result, Err(Error::Format)));
        assert!(arena.is_empty());
        assert_eq!(arena.usage(), Usage::default());
    }

    #[test]
    fn failed_second_pass_returns_block_to_allocator() {
        let allocator = CountingAllocator::default();
        let arena = Arena::with_allocator(allocator.clone());
        let flaky = FailsOnSecondPass(Cell::new(0));

        let result = format(&arena, format_args!("{flaky}"));

        assert!(matches!(result, Err(Error::Format)));
        assert!(arena.is_empty());
        assert_eq!(allocator.live.get(), 0);
        assert_eq!(allocator.total.get(), 1);
    }

    #[test]
    fn long_format_links_block_after_rendering() {
        let allocator = CountingAllocator::default();
        let arena = Arena::with_allocator(allocator.clone());
        _ = duplicate(&arena, "first").unwrap();

        let text = format(&arena, format_args!("{}", "w".repeat(300))).unwrap();

        assert_eq!(unsafe { text.as_str() }, "w".repeat(300));
        assert_eq!(arena.len(), 2);
        assert_eq!(allocator.live.get(), 2);
    }

    #[test]
    fn stack_buffer_counts_past_capacity() {
        let mut buffer = StackBuffer::new();

        buffer.write_str("0123456789").unwrap();
        assert_eq!(buffer.as_str(), Some("0123456789"));

        for _ in 0..20 {
            buffer.write_str("0123456789").unwrap();
        }

        assert_eq!(buffer.required, 210);
        assert_eq!(buffer.as_str(), None);
    }

    #[test]
    fn slice_writer_refuses_to_overrun() {
        let mut storage = [MaybeUninit::<u8>::uninit(); 4];
        let mut writer = SliceWriter {
            target: &mut storage,
            written: 0,
        };

        writer.write_str("abc").unwrap();
        assert_eq!(writer.write_str("de"), Err(fmt::Error));
        assert_eq!(writer.written, 3);
    }
}
