//! A single tracked allocation: a header and its payload sharing one host allocation.

use std::alloc::{GlobalAlloc, Layout, LayoutError};
use std::ptr::NonNull;

use crate::{Error, Result};

/// Alignment of every payload handed out, matching what a C `malloc()` guarantees on
/// 64-bit hosts.
pub(crate) const PAYLOAD_ALIGN: usize = 16;

/// Distance from the start of a block to the start of its payload.
const PAYLOAD_OFFSET: usize = size_of::<Header>().next_multiple_of(PAYLOAD_ALIGN);

const _: () = assert!(align_of::<Header>() <= PAYLOAD_ALIGN);

/// How the payload of a new block is initialized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Fill {
    /// Payload bytes are left uninitialized.
    Uninit,

    /// Payload bytes are zero-filled by the host allocator.
    Zeroed,
}

/// Bookkeeping stored in front of every payload.
///
/// The chain is singly linked and owned from the head: each header owns the block behind
/// `next`, all the way to the end of the chain.
#[repr(C)]
pub(crate) struct Header {
    next: Option<NonNull<Header>>,
    size: usize,
}

/// Layout of the whole block (header plus padding plus payload) for a payload of `size` bytes.
fn block_layout(size: usize) -> Result<Layout> {
    let overflow = |_: LayoutError| Error::SizeOverflow { size };

    let header = Layout::new::<Header>()
        .align_to(PAYLOAD_ALIGN)
        .map_err(overflow)?;
    let payload = Layout::from_size_align(size, PAYLOAD_ALIGN).map_err(overflow)?;

    let (block, offset) = header.extend(payload).map_err(overflow)?;
    debug_assert_eq!(offset, PAYLOAD_OFFSET);

    Ok(block)
}

/// Layout of a block that was allocated with a payload of `size` bytes.
///
/// # Safety
///
/// [`block_layout()`] must have succeeded for `size`.
unsafe fn allocated_layout(size: usize) -> Layout {
    // SAFETY: The caller guarantees that `block_layout(size)` succeeded, which produced a
    // layout of exactly `PAYLOAD_OFFSET + size` bytes, so the sum did not overflow then.
    let total = unsafe { PAYLOAD_OFFSET.unchecked_add(size) };

    // SAFETY: The same size and alignment already formed a valid layout in `block_layout()`.
    unsafe { Layout::from_size_align_unchecked(total, PAYLOAD_ALIGN) }
}

/// Allocates a new, unlinked block with room for `size` payload bytes.
///
/// The block is not part of any chain until [`set_next()`] links it and its owner publishes
/// it. Until then the caller is responsible for passing it to [`deallocate()`].
pub(crate) fn allocate<A: GlobalAlloc>(
    allocator: &A,
    size: usize,
    fill: Fill,
) -> Result<NonNull<Header>> {
    let layout = block_layout(size)?;

    let raw = match fill {
        // SAFETY: The layout is never zero-sized because it always contains the header.
        Fill::Uninit => unsafe { allocator.alloc(layout) },
        // SAFETY: The layout is never zero-sized because it always contains the header.
        Fill::Zeroed => unsafe { allocator.alloc_zeroed(layout) },
    };

    let block = NonNull::new(raw.cast::<Header>()).ok_or(Error::AllocationFailed { layout })?;

    // SAFETY: The block is freshly allocated, large enough for the header and aligned to
    // PAYLOAD_ALIGN, which is at least the alignment of the header.
    unsafe {
        block.write(Header { next: None, size });
    }

    Ok(block)
}

/// Points a block at the next block of its chain.
///
/// # Safety
///
/// `block` must have been returned by [`allocate()`] and not yet passed to [`deallocate()`].
pub(crate) unsafe fn set_next(mut block: NonNull<Header>, next: Option<NonNull<Header>>) {
    // SAFETY: Forwarding guarantee from the caller that the block is live. Only the header
    // is touched, which no payload reference overlaps.
    unsafe { block.as_mut() }.next = next;
}

/// Returns the payload region of a block.
///
/// # Safety
///
/// `block` must have been returned by [`allocate()`] and not yet passed to [`deallocate()`].
pub(crate) unsafe fn payload(block: NonNull<Header>) -> NonNull<[u8]> {
    // SAFETY: Forwarding guarantee from the caller that the block is live.
    let size = unsafe { block.as_ref() }.size;

    // SAFETY: The payload starts PAYLOAD_OFFSET bytes into the same allocation, which was
    // sized to hold PAYLOAD_OFFSET + size bytes.
    let data = unsafe { block.cast::<u8>().add(PAYLOAD_OFFSET) };

    NonNull::slice_from_raw_parts(data, size)
}

/// Returns the payload size of a block.
///
/// # Safety
///
/// `block` must have been returned by [`allocate()`] and not yet passed to [`deallocate()`].
pub(crate) unsafe fn payload_size(block: NonNull<Header>) -> usize {
    // SAFETY: Forwarding guarantee from the caller that the block is live.
    unsafe { block.as_ref() }.size
}

/// Returns a block to the host allocator, header and payload together, and hands back the
/// next block of the chain.
///
/// # Safety
///
/// `block` must have been returned by [`allocate()`] with the same `allocator` and not yet
/// passed to this function. No reference to its payload may be alive.
pub(crate) unsafe fn deallocate<A: GlobalAlloc>(
    allocator: &A,
    block: NonNull<Header>,
) -> Option<NonNull<Header>> {
    // SAFETY: Forwarding guarantee from the caller that the block is live.
    let Header { next, size } = unsafe { block.read() };

    // SAFETY: The block was allocated for this size, so its layout was computed successfully.
    let layout = unsafe { allocated_layout(size) };

    // SAFETY: Forwarding guarantee from the caller that the block came from this allocator
    // with this layout and is not yet released.
    unsafe {
        allocator.dealloc(block.as_ptr().cast(), layout);
    }

    next
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::System;

    use super::*;

    #[test]
    fn payload_follows_header_in_same_block() {
        let block = allocate(&System, 24, Fill::Uninit).unwrap();

        let payload = unsafe { payload(block) };

        assert_eq!(payload.len(), 24);
        assert_eq!(
            payload.cast::<u8>().as_ptr() as usize - block.as_ptr() as usize,
            PAYLOAD_OFFSET
        );
        assert_eq!(payload.cast::<u8>().as_ptr() as usize % PAYLOAD_ALIGN, 0);

        let next = unsafe { deallocate(&System, block) };
        assert!(next.is_none());
    }

    #[test]
    fn zeroed_payload_is_all_zero() {
        let block = allocate(&System, 333, Fill::Zeroed).unwrap();

        let bytes = unsafe { payload(block).as_ref() };
        assert!(bytes.iter().all(|b| *b == 0));

        unsafe { deallocate(&System, block) };
    }

    #[test]
    fn zero_sized_payloads_have_distinct_addresses() {
        let first = allocate(&System, 0, Fill::Uninit).unwrap();
        let second = allocate(&System, 0, Fill::Uninit).unwrap();
        unsafe { set_next(second, Some(first)) };

        let first_payload = unsafe { payload(first) };
        let second_payload = unsafe { payload(second) };

        assert_eq!(first_payload.len(), 0);
        assert_ne!(first_payload.cast::<u8>(), second_payload.cast::<u8>());

        let next = unsafe { deallocate(&System, second) };
        assert_eq!(next, Some(first));
        let next = unsafe { deallocate(&System, first) };
        assert!(next.is_none());
    }

    #[test]
    fn payload_size_is_remembered() {
        let block = allocate(&System, 7, Fill::Uninit).unwrap();

        assert_eq!(unsafe { payload_size(block) }, 7);

        unsafe { deallocate(&System, block) };
    }

    #[test]
    fn oversized_request_is_rejected_before_allocating() {
        let result = allocate(&System, usize::MAX, Fill::Uninit);

        assert!(matches!(result, Err(Error::SizeOverflow { size }) if size == usize::MAX));
    }

    #[test]
    fn new_block_is_unlinked() {
        let block = allocate(&System, 5, Fill::Zeroed).unwrap();

        let next = unsafe { deallocate(&System, block) };
        assert!(next.is_none());
    }

    #[test]
    fn release_layout_matches_allocation_layout() {
        for size in [0, 1, 15, 16, 17, 100, 4096, 65_537] {
            let computed = block_layout(size).unwrap();

            assert_eq!(unsafe { allocated_layout(size) }, computed);
            assert_eq!(computed.size(), PAYLOAD_OFFSET + size);
            assert_eq!(computed.align(), PAYLOAD_ALIGN);
        }
    }

    #[test]
    fn largest_valid_payload_is_accepted_by_layout() {
        let largest = isize::MAX.unsigned_abs() - PAYLOAD_OFFSET - (PAYLOAD_ALIGN - 1);

        assert!(block_layout(largest).is_ok());
        assert!(matches!(
            block_layout(largest + PAYLOAD_ALIGN),
            Err(Error::SizeOverflow { .. })
        ));
    }
}
