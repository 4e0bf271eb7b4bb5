// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::AtomicU16;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use static_assertions::const_assert_eq;

use crate::platform;
use crate::platform::CriticalRegionGuard;

/// Spin-based reader/writer lock over a single 16-bit word.
///
/// The most significant bit reserves the lock for a writer; the low 15
/// bits count shared readers:
///
/// ```text
/// |W|RRRRRRR RRRRRRRR|
/// ```
///
/// At most one thread holds the writer bit, no reader enters while it
/// is set, and up to 2^15 - 1 readers may hold the lock at once. The
/// lock guards short critical sections (pointer relinks, snapshot
/// swaps); it spins and yields rather than blocking, so it must not be
/// held across long operations.
///
/// Locking methods return RAII guards; dropping the guard is the unlock
/// operation. Guards also bracket a host critical region for their
/// lifetime (a no-op on user-space hosts).
pub struct BusyLock {
    lock: AtomicU16,
}

const WRITER: u16 = 1 << 15;
const READER: u16 = 1;
const MAX_READERS: u16 = WRITER - 1;

// Atomic accesses on a misaligned word are undefined behavior on some
// targets; the state must be naturally aligned.
const_assert_eq!(
    core::mem::align_of::<AtomicU16>(),
    core::mem::size_of::<u16>()
);

impl BusyLock {
    /// Creates a new, unheld lock.
    pub const fn new() -> Self {
        Self {
            lock: AtomicU16::new(0),
        }
    }

    /// Acquires the lock exclusively, spinning until granted.
    ///
    /// Reserves the writer bit first, then waits for in-flight readers
    /// to drain, yielding to the scheduler on every failed attempt.
    pub fn lock_exclusive(&self) -> BusyLockWriteGuard<'_> {
        let critical = platform::enter_critical_region();

        loop {
            let current = self.lock.load(Relaxed);
            if current & WRITER == 0
                && self
                    .lock
                    .compare_exchange_weak(current, current | WRITER, Acquire, Relaxed)
                    .is_ok()
            {
                break;
            }
            platform::yield_processor();
        }
        // The writer bit is ours; readers that got in before it was set
        // still have to leave.
        while self.lock.load(Acquire) & MAX_READERS != 0 {
            platform::yield_processor();
        }

        BusyLockWriteGuard {
            lock: self,
            _critical: critical,
        }
    }

    /// Acquires the lock shared, spinning until granted.
    ///
    /// Waits out any writer (held or reserved) and the rare case of a
    /// saturated reader count.
    pub fn lock_shared(&self) -> BusyLockReadGuard<'_> {
        let critical = platform::enter_critical_region();

        loop {
            let current = self.lock.load(Relaxed);
            if current & WRITER == 0
                && current & MAX_READERS < MAX_READERS
                && self
                    .lock
                    .compare_exchange_weak(current, current + READER, Acquire, Relaxed)
                    .is_ok()
            {
                break;
            }
            platform::yield_processor();
        }

        BusyLockReadGuard {
            lock: self,
            _critical: critical,
        }
    }

    fn release_exclusive(&self) {
        let previous = self.lock.fetch_and(!WRITER, Release);
        assert!(previous & WRITER != 0);
    }

    fn release_shared(&self) {
        let previous = self.lock.fetch_sub(READER, Release);
        assert!(previous & MAX_READERS != 0);
    }
}

impl Default for BusyLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BusyLock {
    fn drop(&mut self) {
        // The lock must be free at destruction. Acquiring and releasing
        // exclusive here turns a lingering holder into a visible hang
        // instead of a use-after-free.
        drop(self.lock_exclusive());
    }
}

/// A guard that holds a [`BusyLock`] exclusively until dropped.
pub struct BusyLockWriteGuard<'a> {
    lock: &'a BusyLock,
    _critical: CriticalRegionGuard,
}

impl Drop for BusyLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

/// A guard that holds a [`BusyLock`] shared until dropped.
pub struct BusyLockReadGuard<'a> {
    lock: &'a BusyLock,
    _critical: CriticalRegionGuard,
}

impl Drop for BusyLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn exclusive_then_shared() {
        let lock = BusyLock::new();
        drop(lock.lock_exclusive());
        let r1 = lock.lock_shared();
        let r2 = lock.lock_shared();
        drop(r1);
        drop(r2);
    }

    #[test]
    fn writers_are_mutually_exclusive() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1_000;

        struct Shared {
            lock: BusyLock,
            value: core::cell::UnsafeCell<usize>,
        }
        // SAFETY: `value` is only touched under `lock`.
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: BusyLock::new(),
            value: core::cell::UnsafeCell::new(0),
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let _guard = shared.lock.lock_exclusive();
                        unsafe { *shared.value.get() += 1 };
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let _guard = shared.lock.lock_shared();
        assert_eq!(unsafe { *shared.value.get() }, THREADS * ITERATIONS);
    }

    #[test]
    fn readers_exclude_writer() {
        let lock = Arc::new(BusyLock::new());
        let reader = lock.lock_shared();

        let contender = {
            let lock = lock.clone();
            thread::spawn(move || {
                drop(lock.lock_exclusive());
            })
        };
        // The writer cannot finish while the reader is alive.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());

        drop(reader);
        contender.join().unwrap();
    }

    #[test]
    fn writer_blocks_new_readers() {
        let lock = Arc::new(BusyLock::new());
        let writer = lock.lock_exclusive();

        let contender = {
            let lock = lock.clone();
            thread::spawn(move || {
                drop(lock.lock_shared());
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());

        drop(writer);
        contender.join().unwrap();
    }
}
