// SPDX-License-Identifier: MPL-2.0

use core::mem;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::collections::SingleListEntry;
use crate::mem::LookasideAllocator;
use crate::thread::{Callback, CallbackArgument};
use crate::{Error, Result};

/// A unit of work enqueued on a pool worker.
///
/// Exactly one of the two callbacks runs, exactly once: `callback`
/// while the pool is live, `rundown_callback` when the item is drained
/// during teardown. The record travels through the worker's queue by
/// its embedded entry, which must stay the first field so entry and
/// record share an address.
#[repr(C)]
pub(super) struct WorkItem {
    list_entry: SingleListEntry,
    callback: Callback,
    rundown_callback: Callback,
    argument: CallbackArgument,
}

const_assert_eq!(mem::offset_of!(WorkItem, list_entry), 0);

impl WorkItem {
    /// Builds a work item inside a block from `allocator`.
    pub(super) fn allocate(
        allocator: &LookasideAllocator,
        callback: Callback,
        rundown_callback: Callback,
        argument: CallbackArgument,
    ) -> Result<NonNull<WorkItem>> {
        let block = allocator
            .allocate(mem::size_of::<WorkItem>())
            .ok_or(Error::NoMemory)?;
        let item = block.cast::<WorkItem>();
        // SAFETY: the block is item-sized, aligned for the record, and
        // exclusively ours.
        unsafe {
            item.as_ptr().write(WorkItem {
                list_entry: SingleListEntry::new(),
                callback,
                rundown_callback,
                argument,
            });
        }
        Ok(item)
    }

    /// The queue link of `item`; entry and record share an address.
    pub(super) fn entry(item: NonNull<WorkItem>) -> NonNull<SingleListEntry> {
        item.cast()
    }

    /// Recovers the record from its queue link.
    ///
    /// # Safety
    ///
    /// `entry` must be the link of a live [`WorkItem`].
    pub(super) unsafe fn from_entry(entry: NonNull<SingleListEntry>) -> NonNull<WorkItem> {
        entry.cast()
    }

    /// Runs the user callback of `item`, then releases its storage.
    ///
    /// # Safety
    ///
    /// `item` must have been built by [`allocate`](Self::allocate) from
    /// this `allocator`, be unlinked, and not be touched afterwards.
    pub(super) unsafe fn execute(item: NonNull<WorkItem>, allocator: &LookasideAllocator) {
        // SAFETY: the item is live and ours.
        let (callback, argument) = unsafe {
            let item = item.as_ref();
            (item.callback, item.argument)
        };
        // SAFETY: caller contract.
        unsafe { allocator.free(item.cast()) };
        callback(argument);
    }

    /// Runs the rundown callback of `item`, then releases its storage.
    ///
    /// # Safety
    ///
    /// Same contract as [`execute`](Self::execute).
    pub(super) unsafe fn cancel(item: NonNull<WorkItem>, allocator: &LookasideAllocator) {
        // SAFETY: the item is live and ours.
        let (rundown_callback, argument) = unsafe {
            let item = item.as_ref();
            (item.rundown_callback, item.argument)
        };
        // SAFETY: caller contract.
        unsafe { allocator.free(item.cast()) };
        rundown_callback(argument);
    }
}
