// SPDX-License-Identifier: MPL-2.0

use core::ptr::NonNull;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use crate::collections::TwoLockQueue;
use crate::mem::LookasideAllocator;
use crate::sync::{Signal, WAIT_INFINITE};
use crate::thread::{CallbackArgument, Thread};
use crate::Result;

use super::work_item::WorkItem;

/// Everything one pool worker needs: its thread, its wakeup signal, its
/// private queue of work items and a handle to the allocator the items
/// came from.
///
/// Contexts are shared between the pool (which enqueues and eventually
/// joins) and the worker thread itself, which holds a reference for as
/// long as it runs.
pub(super) struct ThreadContext {
    thread: Thread,
    wake_up: Signal,
    shutdown: AtomicBool,
    work_queue: TwoLockQueue,
    /// Soft count of items sitting in `work_queue`; drives pool growth.
    queued_items: AtomicUsize,
    allocator: Arc<LookasideAllocator>,
}

impl ThreadContext {
    /// Creates a parked context. The worker thread is started
    /// separately with [`start`](Self::start).
    pub(super) fn new(allocator: Arc<LookasideAllocator>) -> Result<Self> {
        Ok(Self {
            thread: Thread::new(),
            // Auto-reset: one set satisfies one wakeup.
            wake_up: Signal::new(false)?,
            shutdown: AtomicBool::new(false),
            work_queue: TwoLockQueue::new(),
            queued_items: AtomicUsize::new(0),
            allocator,
        })
    }

    /// Starts the worker thread on `context`.
    pub(super) fn start(context: &Arc<ThreadContext>) -> Result<()> {
        let raw = Arc::into_raw(context.clone());
        // SAFETY: the worker receives a counted reference that it alone
        // releases, so the pointee outlives the thread.
        let status = unsafe {
            context
                .thread
                .run(worker_main, raw as *mut ThreadContext as CallbackArgument)
        };
        if status.is_err() {
            // The thread never ran; take the reference back.
            // SAFETY: `raw` came from `Arc::into_raw` above.
            drop(unsafe { Arc::from_raw(raw) });
        }
        status
    }

    /// Hands a work item to this worker and wakes it.
    pub(super) fn push_work(&self, item: NonNull<WorkItem>) {
        // SAFETY: a freshly built item is unlinked and its storage
        // stays valid until a drain returns it.
        unsafe { self.work_queue.push(WorkItem::entry(item)) };
        self.queued_items.fetch_add(1, Relaxed);
        self.wake_up.set();
    }

    /// Soft count of not-yet-drained items.
    pub(super) fn workload(&self) -> usize {
        self.queued_items.load(Relaxed)
    }

    /// Tells the worker to exit and wakes it.
    pub(super) fn signal_shutdown(&self) {
        self.shutdown.store(true, Release);
        self.wake_up.set();
    }

    /// Waits for the worker thread to exit.
    pub(super) fn join(&self) {
        self.thread.join();
    }

    /// Drains the queue once, routing each item through its user
    /// callback (in FIFO order) or, when `cancel` is set, its rundown
    /// callback.
    fn drain_work_queue(&self, cancel: bool) {
        let mut cursor = self
            .work_queue
            .flush()
            .map_or(core::ptr::null_mut(), NonNull::as_ptr);
        while let Some(entry) = NonNull::new(cursor) {
            // Read the link before the item is consumed; its storage
            // may be recycled the moment it is freed.
            // SAFETY: entries in this queue are work-item links.
            cursor = unsafe { entry.as_ref().next() };
            let item = unsafe { WorkItem::from_entry(entry) };
            self.queued_items.fetch_sub(1, Relaxed);
            // SAFETY: the item came from our allocator and is unlinked.
            unsafe {
                if cancel {
                    WorkItem::cancel(item, &self.allocator);
                } else {
                    WorkItem::execute(item, &self.allocator);
                }
            }
        }
    }
}

/// The main loop every pool worker runs.
///
/// Sleeps on the wakeup signal, drains the queue on every wakeup and,
/// once shutdown is signaled, performs one final drain in which the
/// rundown callbacks run instead of the user callbacks.
pub(super) fn worker_main(argument: CallbackArgument) {
    // SAFETY: `start` passed us a counted reference.
    let context = unsafe { Arc::from_raw(argument.cast_const().cast::<ThreadContext>()) };

    while !context.shutdown.load(Acquire) {
        context.wake_up.wait(WAIT_INFINITE);
        context.drain_work_queue(false);
    }
    // Nothing new arrives past this point: shutdown follows the pool
    // rundown, so enqueuers are already gone.
    context.drain_work_queue(true);
}
