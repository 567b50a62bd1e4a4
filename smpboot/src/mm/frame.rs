// SPDX-License-Identifier: MPL-2.0

//! The early frame allocator.

use core::alloc::Layout;
use core::ops::Range;

use align_ext::AlignExt;
use spin::Mutex;

use super::{Paddr, PAGE_SIZE};

struct EarlyFrameAllocator {
    cursor: Paddr,
    end: Paddr,
}

static EARLY_ALLOCATOR: Mutex<Option<EarlyFrameAllocator>> = Mutex::new(None);

/// Initializes the early allocator with a donated physical region.
///
/// The region is never handed back; allocations from it live for the rest
/// of the boot session.
pub(crate) fn init(region: Range<Paddr>) {
    let mut allocator = EARLY_ALLOCATOR.lock();
    assert!(allocator.is_none(), "the early allocator is already initialized");

    *allocator = Some(EarlyFrameAllocator {
        cursor: region.start.align_up(PAGE_SIZE),
        end: region.end,
    });
}

/// Allocates a physically contiguous region for the given layout.
///
/// Returns `None` if the allocator is uninitialized or the donated region
/// is exhausted. The memory is not zeroed.
pub(crate) fn early_alloc(layout: Layout) -> Option<Paddr> {
    let mut allocator = EARLY_ALLOCATOR.lock();
    let allocator = allocator.as_mut()?;

    let start = allocator.cursor.align_up(layout.align());
    let end = start.checked_add(layout.size())?;
    if end > allocator.end {
        return None;
    }
    allocator.cursor = end;

    Some(start)
}
