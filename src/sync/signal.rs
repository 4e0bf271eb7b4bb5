// SPDX-License-Identifier: MPL-2.0

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::Result;

/// Wait "timeout" meaning no timeout at all.
pub const WAIT_INFINITE: u32 = u32::MAX;

/// A manual- or auto-reset event.
///
/// A signal is either set or unset. [`set`](Self::set) moves it to the
/// set state: a manual-reset signal then stays set until
/// [`reset`](Self::reset), while an auto-reset signal satisfies one
/// [`wait`](Self::wait) and clears itself. Waiters block at the OS
/// level, optionally bounded by a millisecond timeout.
///
/// Waiters must be drained before the signal is dropped; destruction
/// does not wake anyone.
pub struct Signal {
    manual_reset: bool,
    signaled: Mutex<bool>,
    condition: Condvar,
}

impl Signal {
    /// Creates a signal in the unset state.
    ///
    /// `manual_reset` selects the reset behavior described above.
    pub fn new(manual_reset: bool) -> Result<Self> {
        // Hosted mutexes and condition variables cannot fail to
        // initialize; kernel ports can.
        Ok(Self {
            manual_reset,
            signaled: Mutex::new(false),
            condition: Condvar::new(),
        })
    }

    /// Whether this signal stays set until explicitly reset.
    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Moves the signal to the set state.
    ///
    /// A manual-reset signal wakes every waiter; an auto-reset signal
    /// satisfies a single wait and goes back to unset.
    pub fn set(&self) {
        let mut signaled = self.state();
        *signaled = true;
        if self.manual_reset {
            self.condition.notify_all();
        } else {
            self.condition.notify_one();
        }
    }

    /// Moves the signal to the unset state. Waiters are not affected.
    pub fn reset(&self) {
        *self.state() = false;
    }

    /// Waits until the signal is set, up to `timeout_ms` milliseconds.
    ///
    /// Returns `true` if the signal was observed set within the timeout
    /// (consuming it when auto-reset), `false` on timeout.
    /// [`WAIT_INFINITE`] waits forever.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        let mut signaled = self.state();

        if timeout_ms == WAIT_INFINITE {
            while !*signaled {
                signaled = self
                    .condition
                    .wait(signaled)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
            while !*signaled {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                signaled = self
                    .condition
                    .wait_timeout(signaled, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        if !self.manual_reset {
            *signaled = false;
        }
        true
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        // A poisoned mutex means a waiter panicked while holding it;
        // the boolean inside is still coherent.
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
