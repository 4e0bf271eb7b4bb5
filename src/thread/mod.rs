// SPDX-License-Identifier: MPL-2.0

//! One-shot OS threads and the pool built on top of them.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use std::thread::JoinHandle;

use log::error;

use crate::sync::BusyLock;
use crate::{Error, Result};

pub mod work_queue;

/// Argument handed to a [`Callback`].
pub type CallbackArgument = *mut c_void;

/// A callback scheduled on a thread or a pool worker.
///
/// Callbacks must not unwind; a panic that escapes one is reported and
/// swallowed at the thread boundary.
pub type Callback = fn(CallbackArgument);

/// Moves a raw callback argument across the spawn boundary. The safety
/// obligations travel with the `unsafe` of [`Thread::run`].
struct SendArgument(CallbackArgument);

// SAFETY: `Thread::run` callers vouch that the pointee may be handed to
// another thread.
unsafe impl Send for SendArgument {}

/// A one-shot worker thread.
///
/// `run` schedules a callback on a fresh OS thread; `join` waits for it
/// and reclaims the thread. An instance can be reused, but only after
/// the previous callback was joined. A [`BusyLock`] guards the internal
/// context so concurrent misuse fails with
/// [`Error::InvalidState`] instead of corrupting it.
pub struct Thread {
    context_lock: BusyLock,
    context: UnsafeCell<Option<JoinHandle<()>>>,
}

// SAFETY: `context` is only touched under `context_lock`.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a thread wrapper with nothing scheduled.
    pub const fn new() -> Self {
        Self {
            context_lock: BusyLock::new(),
            context: UnsafeCell::new(None),
        }
    }

    /// Spawns an OS thread executing `callback(argument)` exactly once.
    ///
    /// Fails with [`Error::InvalidState`] while a previous callback has
    /// not been joined, and with [`Error::NoMemory`] when the host
    /// cannot spawn a thread.
    ///
    /// # Safety
    ///
    /// `argument` crosses to the new thread as a raw pointer: it must
    /// point to memory that stays valid until the callback finishes and
    /// that may be accessed from that thread.
    pub unsafe fn run(&self, callback: Callback, argument: CallbackArgument) -> Result<()> {
        let _guard = self.context_lock.lock_exclusive();
        // SAFETY: context lock held.
        let context = unsafe { &mut *self.context.get() };
        if context.is_some() {
            return Err(Error::InvalidState);
        }

        let argument = SendArgument(argument);
        let handle = std::thread::Builder::new()
            .spawn(move || {
                let argument = argument;
                callback(argument.0);
            })
            .map_err(|_| Error::NoMemory)?;
        *context = Some(handle);
        Ok(())
    }

    /// Waits for the scheduled callback to finish, if any.
    ///
    /// After this returns the instance may be re-`run`.
    pub fn join(&self) {
        let _guard = self.context_lock.lock_exclusive();
        // SAFETY: context lock held.
        let context = unsafe { &mut *self.context.get() };
        if let Some(handle) = context.take() {
            if handle.join().is_err() {
                error!("a thread callback panicked; continuing");
            }
        }
    }

    /// Whether a callback is currently scheduled or running.
    pub fn is_joinable(&self) -> bool {
        let _guard = self.context_lock.lock_shared();
        // SAFETY: context lock held (shared; read-only access).
        unsafe { (*self.context.get()).is_some() }
    }

    /// The identifier of the underlying OS thread, when one is running.
    pub fn id(&self) -> Option<std::thread::ThreadId> {
        let _guard = self.context_lock.lock_shared();
        // SAFETY: context lock held (shared; read-only access).
        unsafe { (*self.context.get()).as_ref().map(|h| h.thread().id()) }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join();
    }
}
