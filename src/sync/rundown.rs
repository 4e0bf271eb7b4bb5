// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};

use static_assertions::const_assert_eq;

use crate::platform;
use crate::platform::CriticalRegionGuard;

/// Rundown bit. Once set it never clears.
const RUNDOWN_ACTIVE: u64 = 1;

/// References step by two so they never perturb the rundown bit.
const RUNDOWN_INCREMENT: u64 = 2;

const_assert_eq!(
    core::mem::align_of::<AtomicU64>(),
    core::mem::size_of::<u64>()
);

/// Coordinates the teardown of a shared object against in-flight users.
///
/// An object is run down when all outstanding accesses have finished and
/// no new access will be granted. Users bracket each access with
/// [`acquire`](Self::acquire)/[`release`](Self::release) (or, more
/// conveniently, [`protect`](Self::protect)); the owner calls
/// [`wait_for_release`](Self::wait_for_release) before tearing the
/// object down.
///
/// The whole state lives in one 64-bit word: bit 0 is the sticky
/// "rundown active" flag, bits 1..63 hold twice the live-reference
/// count, so a single atomic operation commits both.
pub struct RundownProtection {
    state: AtomicU64,
}

impl RundownProtection {
    /// Creates a rundown with no outstanding references.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Tries to take a reference on the protected object.
    ///
    /// Returns `false` once rundown has begun. Every `true` return must
    /// be paired with exactly one [`release`](Self::release).
    #[must_use]
    pub fn acquire(&self) -> bool {
        if self.state.load(Acquire) & RUNDOWN_ACTIVE != 0 {
            return false;
        }
        let previous = self.state.fetch_add(RUNDOWN_INCREMENT, Acquire);
        if previous & RUNDOWN_ACTIVE != 0 {
            // Lost the race with wait_for_release between the read and
            // the add; undo our reference.
            self.state.fetch_sub(RUNDOWN_INCREMENT, Release);
            return false;
        }
        true
    }

    /// Drops a reference previously granted by [`acquire`](Self::acquire).
    pub fn release(&self) {
        let previous = self.state.fetch_sub(RUNDOWN_INCREMENT, Release);
        assert!(previous & !RUNDOWN_ACTIVE != 0);
    }

    /// Blocks new references and waits for the outstanding ones to drain.
    ///
    /// After this returns, [`acquire`](Self::acquire) fails forever and
    /// the protected object may be torn down. Safe to call more than
    /// once; later calls return as soon as the count is zero.
    pub fn wait_for_release(&self) {
        self.state.fetch_or(RUNDOWN_ACTIVE, AcqRel);
        while self.state.load(Acquire) != RUNDOWN_ACTIVE {
            platform::yield_processor();
        }
    }

    /// Whether rundown has begun.
    pub fn is_run_down(&self) -> bool {
        self.state.load(Acquire) & RUNDOWN_ACTIVE != 0
    }

    /// Acquires the rundown through a guard.
    ///
    /// Returns `None` once rundown has begun; otherwise the reference is
    /// dropped when the guard goes out of scope. The guard also brackets
    /// a host critical region for its lifetime.
    pub fn protect(&self) -> Option<RundownGuard<'_>> {
        let critical = platform::enter_critical_region();
        if self.acquire() {
            Some(RundownGuard {
                rundown: self,
                _critical: critical,
            })
        } else {
            None
        }
    }
}

impl Default for RundownProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RundownProtection {
    fn drop(&mut self) {
        self.wait_for_release();
    }
}

/// Holds one reference on a [`RundownProtection`] until dropped.
pub struct RundownGuard<'a> {
    rundown: &'a RundownProtection,
    _critical: CriticalRegionGuard,
}

impl Drop for RundownGuard<'_> {
    fn drop(&mut self) {
        self.rundown.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_release_pairs() {
        let rundown = RundownProtection::new();
        assert!(rundown.acquire());
        assert!(rundown.acquire());
        rundown.release();
        rundown.release();
        rundown.wait_for_release();
        assert!(!rundown.acquire());
    }

    #[test]
    fn guard_releases_on_drop() {
        let rundown = RundownProtection::new();
        {
            let guard = rundown.protect();
            assert!(guard.is_some());
        }
        rundown.wait_for_release();
        assert!(rundown.protect().is_none());
        assert!(rundown.is_run_down());
    }

    #[test]
    fn wait_blocks_until_last_release() {
        let rundown = Arc::new(RundownProtection::new());
        assert!(rundown.acquire());

        let drained = Arc::new(AtomicBool::new(false));
        let waiter = {
            let rundown = rundown.clone();
            let drained = drained.clone();
            thread::spawn(move || {
                rundown.wait_for_release();
                drained.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!drained.load(Ordering::Acquire));

        rundown.release();
        waiter.join().unwrap();
        assert!(drained.load(Ordering::Acquire));
    }

    #[test]
    fn acquires_race_against_rundown() {
        let rundown = Arc::new(RundownProtection::new());
        let successes = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let rundown = rundown.clone();
                let successes = successes.clone();
                let releases = releases.clone();
                thread::spawn(move || loop {
                    if !rundown.acquire() {
                        break;
                    }
                    successes.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    releases.fetch_add(1, Ordering::Relaxed);
                    rundown.release();
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        rundown.wait_for_release();
        // Every acquire that succeeded had released by the time the
        // drain returned.
        assert_eq!(
            successes.load(Ordering::Relaxed),
            releases.load(Ordering::Relaxed)
        );

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(!rundown.acquire());
    }
}
