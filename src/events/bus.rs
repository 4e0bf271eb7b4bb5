// SPDX-License-Identifier: MPL-2.0

use core::cell::UnsafeCell;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use log::debug;

use crate::mem::LookasideAllocator;
use crate::platform;
use crate::sync::{BusyLock, RundownProtection};
use crate::thread::work_queue::ThreadPool;
use crate::thread::CallbackArgument;
use crate::{Error, Result};

use super::{DispatchMode, Event, EventListener, ListenerId};

/// Once this many async events are in flight, further async dispatches
/// run inline on the caller to relieve the pool.
const ASYNC_THRESHOLD: u32 = 256;

/// One registered listener.
///
/// The rundown is taken for every delivery to this listener, so
/// unregistration can drain outstanding callbacks before returning.
struct ListenerRecord {
    rundown: RundownProtection,
    id: ListenerId,
    listener: Arc<dyn EventListener>,
}

/// The snapshot every dispatch iterates: an immutable, reference-counted
/// copy of the registered listeners. Register and unregister replace the
/// whole vector instead of mutating it, so dispatchers never hold a lock
/// across a listener callback.
type ListenerSnapshot = Arc<Vec<Arc<ListenerRecord>>>;

/// Envelope of one asynchronously dispatched event, allocated from the
/// bus lookaside and carried through the pool as a raw work argument.
///
/// The bus pointer stays valid for the whole life of the envelope: the
/// bus is heap-anchored behind the `Arc` returned by [`EventBus::new`],
/// and its rundown drains the pool (running either the work or the
/// rundown callback of every envelope) before the bus can be dropped.
struct EventData {
    event: Arc<dyn Event>,
    bus: *const EventBus,
}

/// A registry of listeners plus a dispatcher over an owned thread pool.
///
/// Listeners come and go at any time; events are delivered inline or on
/// a worker. Delivery to a listener is bracketed by that listener's
/// rundown, so [`unregister_listener`](Self::unregister_listener) does
/// not return while an `on_event` for that listener is still running.
pub struct EventBus {
    /// Blocks registration and dispatch once teardown starts.
    rundown: RundownProtection,
    /// Envelopes all have the same size; a lookaside recycles them.
    event_allocator: LookasideAllocator,
    /// Runs the async deliveries.
    async_pool: ThreadPool,
    listeners_lock: BusyLock,
    /// Current listener snapshot, guarded by `listeners_lock`.
    listeners: UnsafeCell<ListenerSnapshot>,
    /// Async envelopes in flight, for the steal threshold.
    enqueued_async_items: AtomicU32,
}

// SAFETY: `listeners` is only accessed under `listeners_lock`; the raw
// bus pointers inside envelopes are managed as described on `EventData`.
unsafe impl Send for EventBus {}
unsafe impl Sync for EventBus {}

impl EventBus {
    /// Creates a bus with its own worker pool.
    ///
    /// The bus lives behind an `Arc` so that queued envelopes may refer
    /// to it; it is torn down by [`rundown`](Self::rundown) or when the
    /// last reference drops.
    pub fn new() -> Result<Arc<EventBus>> {
        Ok(Arc::new(EventBus {
            rundown: RundownProtection::new(),
            event_allocator: LookasideAllocator::new(mem::size_of::<EventData>(), true),
            async_pool: ThreadPool::new()?,
            listeners_lock: BusyLock::new(),
            listeners: UnsafeCell::new(Arc::new(Vec::new())),
            enqueued_async_items: AtomicU32::new(0),
        }))
    }

    /// Registers `listener`; it starts receiving events immediately.
    ///
    /// Returns the identifier to later unregister it with. Fails with
    /// [`Error::RundownInProgress`] once teardown has started.
    pub fn register_listener(&self, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        let Some(_guard) = self.rundown.protect() else {
            return Err(Error::RundownInProgress);
        };

        let id = ListenerId::generate();
        let record = Arc::new(ListenerRecord {
            rundown: RundownProtection::new(),
            id,
            listener,
        });

        let _listeners_guard = self.listeners_lock.lock_exclusive();
        let current = self.snapshot_locked();
        // Records that already ran down are dead weight; drop them from
        // the clone.
        let mut next: Vec<Arc<ListenerRecord>> = current
            .iter()
            .filter(|record| !record.rundown.is_run_down())
            .cloned()
            .collect();
        next.push(record);
        self.replace_snapshot_locked(Arc::new(next));

        debug!("event bus: registered listener {:?}", id);
        Ok(id)
    }

    /// Unregisters the listener behind `id`.
    ///
    /// When this returns, no `on_event` for that listener is running
    /// and none will start. Fails with [`Error::NotFound`] for an
    /// unknown identifier and [`Error::RundownInProgress`] once
    /// teardown has started.
    ///
    /// Calling this from inside the listener's own `on_event` deadlocks:
    /// the drain would wait for the caller itself.
    pub fn unregister_listener(&self, id: ListenerId) -> Result<()> {
        let Some(_guard) = self.rundown.protect() else {
            return Err(Error::RundownInProgress);
        };

        let removed = {
            let _listeners_guard = self.listeners_lock.lock_exclusive();
            let current = self.snapshot_locked();
            let Some(removed) = current.iter().find(|record| record.id == id).cloned() else {
                return Err(Error::NotFound);
            };
            let next: Vec<Arc<ListenerRecord>> = current
                .iter()
                .filter(|record| record.id != id)
                .cloned()
                .collect();
            self.replace_snapshot_locked(Arc::new(next));
            removed
        };

        // Outside the lock: dispatchers working off an older snapshot
        // may still be delivering to this listener. Wait them out.
        removed.rundown.wait_for_release();
        debug!("event bus: unregistered listener {:?}", id);
        Ok(())
    }

    /// Dispatches `event` to every registered listener.
    ///
    /// `DispatchMode::Sync` delivers inline; `DispatchMode::Async`
    /// queues the event onto the pool; `DispatchMode::Auto` picks
    /// inline delivery whenever the execution context permits it.
    /// Fails with [`Error::RundownInProgress`] once teardown has
    /// started, [`Error::UnsupportedContext`] for an explicit sync
    /// dispatch where the host forbids one, and [`Error::NoMemory`]
    /// when no envelope can be built.
    pub fn dispatch(&self, event: Arc<dyn Event>, mode: DispatchMode) -> Result<()> {
        let Some(_guard) = self.rundown.protect() else {
            return Err(Error::RundownInProgress);
        };

        let inline = match mode {
            DispatchMode::Sync => {
                if !platform::can_dispatch_inline() {
                    return Err(Error::UnsupportedContext);
                }
                true
            }
            DispatchMode::Async => false,
            DispatchMode::Auto => platform::can_dispatch_inline(),
        };
        if inline {
            self.notify_listeners(&event);
            return Ok(());
        }

        // Steal: with too many envelopes already queued, servicing this
        // one on the caller is kinder than growing the backlog.
        if self.enqueued_async_items.load(Relaxed) > ASYNC_THRESHOLD {
            self.notify_listeners(&event);
            return Ok(());
        }
        self.enqueue_async(event)
    }

    /// Runs the bus down: blocks further operations, cancels or
    /// finishes queued events, and drains every listener.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn rundown(&self) {
        self.rundown.wait_for_release();
        // Queued envelopes either deliver or are cancelled here; both
        // paths release their envelope.
        self.async_pool.rundown();

        let snapshot = {
            let _listeners_guard = self.listeners_lock.lock_exclusive();
            let current = self.snapshot_locked();
            self.replace_snapshot_locked(Arc::new(Vec::new()));
            current
        };
        if !snapshot.is_empty() {
            debug!("event bus rundown: draining {} listeners", snapshot.len());
        }
        for record in snapshot.iter() {
            record.rundown.wait_for_release();
        }
    }

    /// Delivers `event` to the listeners in the current snapshot, in
    /// registration order.
    fn notify_listeners(&self, event: &Arc<dyn Event>) {
        let snapshot = {
            let _listeners_guard = self.listeners_lock.lock_shared();
            // Cheap: bumps the snapshot refcount, nothing more.
            self.snapshot_locked()
        };

        for record in snapshot.iter() {
            // A listener mid-unregistration is skipped; the guard keeps
            // `unregister_listener` waiting while we are inside its
            // `on_event`.
            let Some(_delivery_guard) = record.rundown.protect() else {
                continue;
            };
            record.listener.on_event(event, self);
        }
    }

    fn enqueue_async(&self, event: Arc<dyn Event>) -> Result<()> {
        let block = self
            .event_allocator
            .allocate(mem::size_of::<EventData>())
            .ok_or(Error::NoMemory)?;
        let data = block.cast::<EventData>();
        // SAFETY: the block is envelope-sized and exclusively ours.
        unsafe {
            data.as_ptr().write(EventData {
                event,
                bus: self as *const EventBus,
            });
        }

        self.enqueued_async_items.fetch_add(1, Relaxed);
        // SAFETY: the envelope stays valid until one of the callbacks
        // consumes it, and both callbacks are safe to run on a worker.
        let status = unsafe {
            self.async_pool.enqueue(
                async_callback,
                async_rundown_callback,
                data.as_ptr().cast(),
            )
        };
        if let Err(error) = status {
            // SAFETY: the pool took no ownership; the envelope is ours.
            unsafe { self.release_event_data(data) };
            return Err(error);
        }
        Ok(())
    }

    /// Consumes an envelope: drops its payload, recycles its block and
    /// uncounts it.
    ///
    /// # Safety
    ///
    /// `data` must be a live envelope created by
    /// [`enqueue_async`](Self::enqueue_async) on this bus, not touched
    /// afterwards.
    unsafe fn release_event_data(&self, data: NonNull<EventData>) {
        // SAFETY: caller contract; the write in `enqueue_async`
        // initialized the envelope.
        unsafe {
            ptr::drop_in_place(data.as_ptr());
            self.event_allocator.free(data.cast());
        }
        self.enqueued_async_items.fetch_sub(1, Relaxed);
    }

    fn snapshot_locked(&self) -> ListenerSnapshot {
        // SAFETY: callers hold `listeners_lock` (shared suffices for a
        // clone, exclusive for replacement).
        unsafe { (*self.listeners.get()).clone() }
    }

    fn replace_snapshot_locked(&self, next: ListenerSnapshot) {
        // SAFETY: callers hold `listeners_lock` exclusively.
        unsafe { *self.listeners.get() = next };
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.rundown();
    }
}

/// Pool work callback of an async envelope: deliver, then consume.
fn async_callback(argument: CallbackArgument) {
    let data = argument.cast::<EventData>();
    // SAFETY: the argument is the envelope `enqueue_async` built, and
    // the bus outlives every queued envelope.
    unsafe {
        let bus = &*(*data).bus;
        bus.notify_listeners(&(*data).event);
        bus.release_event_data(NonNull::new_unchecked(data));
    }
}

/// Pool rundown callback of an async envelope: consume without
/// delivering.
fn async_rundown_callback(argument: CallbackArgument) {
    let data = argument.cast::<EventData>();
    // SAFETY: as in `async_callback`.
    unsafe {
        let bus = &*(*data).bus;
        bus.release_event_data(NonNull::new_unchecked(data));
    }
}
