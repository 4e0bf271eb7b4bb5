// SPDX-License-Identifier: MPL-2.0

//! A dynamically growing pool of worker threads.
//!
//! Work items are distributed round-robin onto per-worker queues;
//! workers sleep on a signal and drain their own queue, so items bound
//! for different workers never contend. When one worker's queue backs
//! up, the pool spawns another worker, up to a fixed quota.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use log::debug;

use crate::mem::LookasideAllocator;
use crate::sync::{BusyLock, RundownProtection};
use crate::thread::{Callback, CallbackArgument};
use crate::{Error, Result};

mod work_item;
mod worker;

use self::work_item::WorkItem;
use self::worker::ThreadContext;

/// Workers spawned when the pool is created. More than one, so an
/// initial burst of work does not pile onto a single thread.
const INITIAL_THREAD_QUOTA: usize = 2;

/// Hard ceiling on the number of workers.
const MAX_THREAD_QUOTA: usize = 64;

/// A worker with more than this many queued items triggers the spawn of
/// an additional worker.
const MAX_WORKLOAD_SIZE: usize = 512;

/// A round-robin dispatcher of work items onto worker threads.
///
/// Each enqueued item runs exactly once: its user callback while the
/// pool is live, or its rundown callback if the pool is torn down
/// first. Items assigned to the same worker run in enqueue order;
/// across workers there is no ordering guarantee.
pub struct ThreadPool {
    /// Blocks new enqueues (and thereby new worker spawns) once
    /// teardown starts.
    rundown: RundownProtection,
    /// Work items all have the same size; a lookaside recycles them.
    /// Workers share the handle so they can free what they drain.
    work_item_allocator: Arc<LookasideAllocator>,
    threads_lock: BusyLock,
    /// Worker contexts, guarded by `threads_lock`.
    threads: UnsafeCell<Vec<Arc<ThreadContext>>>,
    /// Deliberately a plain load/store pair: a little imbalance is
    /// cheaper than a contended atomic on the enqueue path.
    round_robin_index: AtomicUsize,
}

// SAFETY: `threads` is only accessed under `threads_lock`; everything
// else is atomic or internally synchronized.
unsafe impl Send for ThreadPool {}
unsafe impl Sync for ThreadPool {}

impl ThreadPool {
    /// Creates a pool with [`INITIAL_THREAD_QUOTA`] workers.
    ///
    /// On failure, whatever was spawned is torn down again and the
    /// error is returned.
    pub fn new() -> Result<ThreadPool> {
        let pool = ThreadPool {
            rundown: RundownProtection::new(),
            work_item_allocator: Arc::new(LookasideAllocator::new(
                mem::size_of::<WorkItem>(),
                true,
            )),
            threads_lock: BusyLock::new(),
            threads: UnsafeCell::new(Vec::new()),
            round_robin_index: AtomicUsize::new(0),
        };
        for _ in 0..INITIAL_THREAD_QUOTA {
            if let Err(error) = pool.create_thread_context() {
                pool.rundown();
                return Err(error);
            }
        }
        Ok(pool)
    }

    /// Schedules `callback(argument)` on one of the workers.
    ///
    /// `rundown_callback` runs instead (once, with the same argument)
    /// if the pool is run down before the item is reached; it should
    /// only release whatever `argument` owns. Exactly one of the two
    /// callbacks runs, exactly once.
    ///
    /// Fails with [`Error::RundownInProgress`] after teardown has
    /// started and [`Error::NoMemory`] when no work item can be built.
    ///
    /// # Safety
    ///
    /// `argument` is handed to a worker thread as a raw pointer: it
    /// must stay valid until one of the callbacks has run, and must be
    /// safe to access from that thread.
    pub unsafe fn enqueue(
        &self,
        callback: Callback,
        rundown_callback: Callback,
        argument: CallbackArgument,
    ) -> Result<()> {
        let Some(_guard) = self.rundown.protect() else {
            return Err(Error::RundownInProgress);
        };

        let (mut target, thread_count) = {
            let _threads_guard = self.threads_lock.lock_shared();
            // SAFETY: threads lock held.
            let threads = unsafe { &*self.threads.get() };
            let index = self.round_robin_index.load(Relaxed);
            self.round_robin_index.store(index.wrapping_add(1), Relaxed);
            (threads[index % threads.len()].clone(), threads.len())
        };

        // A backed-up worker grows the pool, best effort: on spawn
        // failure the item simply stays with its original target.
        if target.workload() > MAX_WORKLOAD_SIZE
            && thread_count < MAX_THREAD_QUOTA
            && self.create_thread_context().is_ok()
        {
            let _threads_guard = self.threads_lock.lock_shared();
            // SAFETY: threads lock held.
            let threads = unsafe { &*self.threads.get() };
            if let Some(youngest) = threads.last() {
                target = youngest.clone();
            }
        }

        let item = WorkItem::allocate(
            &self.work_item_allocator,
            callback,
            rundown_callback,
            argument,
        )?;
        target.push_work(item);
        Ok(())
    }

    /// Runs the pool down: blocks further enqueues, lets every already
    /// queued item run its rundown callback, and joins all workers.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn rundown(&self) {
        self.rundown.wait_for_release();

        let threads = {
            let _threads_guard = self.threads_lock.lock_shared();
            // SAFETY: threads lock held.
            unsafe { &*self.threads.get() }.clone()
        };
        if threads.is_empty() {
            return;
        }
        debug!("thread pool rundown: stopping {} workers", threads.len());

        for context in &threads {
            context.signal_shutdown();
        }
        for context in &threads {
            context.join();
        }

        let _threads_guard = self.threads_lock.lock_exclusive();
        // SAFETY: threads lock held.
        unsafe { &mut *self.threads.get() }.clear();
    }

    /// Number of live workers. Mostly useful to tests and diagnostics.
    pub fn thread_count(&self) -> usize {
        let _threads_guard = self.threads_lock.lock_shared();
        // SAFETY: threads lock held.
        unsafe { &*self.threads.get() }.len()
    }

    fn create_thread_context(&self) -> Result<()> {
        let context = Arc::new(ThreadContext::new(self.work_item_allocator.clone())?);
        ThreadContext::start(&context)?;

        let _threads_guard = self.threads_lock.lock_exclusive();
        // SAFETY: threads lock held.
        let threads = unsafe { &mut *self.threads.get() };
        threads.push(context);
        debug!("thread pool grew to {} workers", threads.len());
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.rundown();
    }
}
