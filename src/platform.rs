// SPDX-License-Identifier: MPL-2.0

//! Host services consumed by the rest of the crate.
//!
//! Everything the core needs from the host lives here: raw block
//! allocation with a critical (retrying) tier, sleeping and yielding,
//! a 100-ns tick clock, random identifiers and the critical-region
//! bracketing hook. A kernel port replaces the bodies in this module;
//! the rest of the crate stays unchanged.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;

/// How many extra attempts a critical allocation gets before giving up.
const CRITICAL_ALLOCATION_RETRIES: u32 = 5;

/// How long to sleep between critical allocation attempts, in milliseconds.
const CRITICAL_ALLOCATION_RETRY_DELAY_MS: u32 = 20;

/// Offset between 1601-01-01 (the tick epoch) and 1970-01-01, in 100-ns units.
const UNIX_EPOCH_IN_TICKS: u64 = 116_444_736_000_000_000;

/// Allocates a zero-filled block described by `layout`.
///
/// A critical allocation retries a bounded number of times, sleeping
/// briefly between attempts, before reporting failure. Returns `None`
/// when the host allocator cannot satisfy the request.
pub fn allocate(layout: Layout, critical: bool) -> Option<NonNull<u8>> {
    debug_assert!(layout.size() > 0);

    let mut attempts = if critical {
        1 + CRITICAL_ALLOCATION_RETRIES
    } else {
        1
    };
    loop {
        // SAFETY: `layout` has a non-zero size.
        let block = unsafe { std::alloc::alloc_zeroed(layout) };
        if let Some(block) = NonNull::new(block) {
            return Some(block);
        }

        attempts -= 1;
        if attempts == 0 {
            return None;
        }
        warn!(
            "critical allocation of {} bytes failed, retrying",
            layout.size()
        );
        sleep(CRITICAL_ALLOCATION_RETRY_DELAY_MS);
    }
}

/// Returns a block previously obtained from [`allocate`] to the host.
///
/// # Safety
///
/// `block` must have been returned by [`allocate`] with this exact
/// `layout`, and must not be used afterwards.
pub unsafe fn deallocate(block: NonNull<u8>, layout: Layout) {
    // SAFETY: the caller guarantees the block/layout pairing.
    unsafe { std::alloc::dealloc(block.as_ptr(), layout) };
}

/// Suspends the current thread for the given number of milliseconds.
///
/// Zero relinquishes the remainder of the time slice.
pub fn sleep(milliseconds: u32) {
    if milliseconds == 0 {
        yield_processor();
    } else {
        std::thread::sleep(Duration::from_millis(u64::from(milliseconds)));
    }
}

/// Gives the scheduler a chance to run other threads.
pub fn yield_processor() {
    std::thread::yield_now();
}

/// Current time as 100-nanosecond intervals since 1601-01-01 (UTC).
pub fn current_time() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let ticks = since_unix.as_nanos() / 100;
    UNIX_EPOCH_IN_TICKS + ticks as u64
}

/// Generates a random 128-bit identifier with RFC 4122 v4 framing.
///
/// Entropy comes from the system source; exhausting it is an invariant
/// violation and panics.
pub fn random_uuid() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("system entropy source failed");
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}

/// Marker held by lock and rundown guards for the duration of their
/// critical section.
///
/// User-space hosts have nothing to bracket, so this is empty. Kernel
/// ports hook their enter/leave critical-region calls (raising the
/// thread's scheduling state while the guard lives) into
/// [`enter_critical_region`] and a `Drop` impl here.
pub struct CriticalRegionGuard {
    // Keeps the guard out of Send/Sync: a critical region belongs to
    // the thread that entered it.
    _not_send: PhantomData<*mut ()>,
}

/// Brackets a host critical region.
pub fn enter_critical_region() -> CriticalRegionGuard {
    CriticalRegionGuard {
        _not_send: PhantomData,
    }
}

/// Whether an event may be delivered inline on the calling thread.
///
/// Kernel hosts answer based on the current interrupt level; user-space
/// hosts always permit inline delivery.
pub fn can_dispatch_inline() -> bool {
    true
}
