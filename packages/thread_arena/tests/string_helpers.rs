//! Tracked string duplication and formatting through the per-thread registry.

use std::cell::Cell;
use std::ffi::CStr;
use std::fmt;

use thread_arena::{
    Error, current_thread_usage, release_current_thread_tracked, tracked_sprintf,
    tracked_strdup, try_tracked_format, try_tracked_strdup,
};

struct Refuses;

impl fmt::Display for Refuses {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Err(fmt::Error)
    }
}

/// Renders 200 bytes on every pass. The second pass releases the thread's tracked
/// allocations first, or fails after writing if `fail_second_pass` is set.
struct Reentrant {
    passes: Cell<usize>,
    fail_second_pass: bool,
}

impl Reentrant {
    fn new(fail_second_pass: bool) -> Self {
        Self {
            passes: Cell::new(0),
            fail_second_pass,
        }
    }
}

impl fmt::Display for Reentrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pass = self.passes.get().saturating_add(1);
        self.passes.set(pass);

        let second_pass = pass == 2;

        if second_pass && !self.fail_second_pass {
            release_current_thread_tracked();
        }

        f.write_str(&"r".repeat(200))?;

        if second_pass && self.fail_second_pass {
            return Err(fmt::Error);
        }

        Ok(())
    }
}

#[test]
fn strdup_copies_text_and_terminator() {
    for original in ["", "a", "hello world", "ünïcödé ✓"] {
        let copy = tracked_strdup(original);

        assert_eq!(copy.len(), original.len());

        if !original.is_empty() {
            assert_ne!(copy.as_ptr(), original.as_ptr());
        }

        // SAFETY: No release has happened on this thread since `copy` was created.
        let with_nul = unsafe { copy.as_bytes_with_nul() };
        assert_eq!(with_nul.strip_suffix(b"\0"), Some(original.as_bytes()));
    }

    release_current_thread_tracked();
}

#[test]
fn strdup_of_long_text() {
    let original = "long text ".repeat(1000);

    let copy = try_tracked_strdup(&original).unwrap();

    // SAFETY: No release has happened on this thread since `copy` was created.
    assert_eq!(unsafe { copy.as_str() }, original);

    release_current_thread_tracked();
}

#[test]
fn sprintf_formats_short_text() {
    let text = tracked_sprintf!("{}-{}", 7, "x");

    // SAFETY: No release has happened on this thread since `text` was created.
    assert_eq!(unsafe { text.as_str() }, "7-x");

    // SAFETY: As above; the text contains no interior NUL.
    let c_str = unsafe { CStr::from_ptr(text.as_c_ptr()) };
    assert_eq!(c_str.to_bytes(), b"7-x");

    release_current_thread_tracked();
}

#[test]
fn sprintf_does_not_truncate_long_output() {
    let argument = "z".repeat(500);

    let text = tracked_sprintf!("<{}>", argument);

    assert_eq!(text.len(), 502);

    // SAFETY: No release has happened on this thread since `text` was created.
    assert_eq!(unsafe { text.as_str() }, format!("<{argument}>"));

    release_current_thread_tracked();
}

#[test]
fn string_helpers_are_tracked() {
    release_current_thread_tracked();

    _ = tracked_strdup("one");
    _ = tracked_sprintf!("{}", 2);
    _ = tracked_sprintf!("{}", "3".repeat(300));

    assert_eq!(current_thread_usage().allocations, 3);

    release_current_thread_tracked();
    assert_eq!(current_thread_usage().allocations, 0);
}

#[test]
fn failing_formatter_is_reported_by_try_variant() {
    let result = try_tracked_format(format_args!("{}", Refuses));

    assert!(matches!(result, Err(Error::Format)));

    release_current_thread_tracked();
}

#[test]
#[should_panic(expected = "formatting trait implementation")]
fn failing_formatter_panics_in_infallible_variant() {
    _ = tracked_sprintf!("{}", Refuses);
}

#[test]
fn release_during_formatting_keeps_result_alive() {
    _ = tracked_strdup("released by the formatter");
    let value = Reentrant::new(false);

    let text = tracked_sprintf!("{value}");

    assert_eq!(value.passes.get(), 2);
    assert_eq!(text.len(), 200);

    // The earlier string went away with the release; the formatted one was tracked after it.
    let usage = current_thread_usage();
    assert_eq!(usage.allocations, 1);
    assert_eq!(usage.bytes, 201);

    // SAFETY: No release has happened on this thread since `text` was returned.
    assert_eq!(unsafe { text.as_str() }, "r".repeat(200));

    release_current_thread_tracked();
}

#[test]
fn failed_second_formatting_pass_tracks_nothing() {
    release_current_thread_tracked();
    let value = Reentrant::new(true);

    let result = try_tracked_format(format_args!("{value}"));

    assert!(matches!(result, Err(Error::Format)));
    assert_eq!(value.passes.get(), 2);
    assert_eq!(current_thread_usage().allocations, 0);
    assert_eq!(current_thread_usage().bytes, 0);
}
