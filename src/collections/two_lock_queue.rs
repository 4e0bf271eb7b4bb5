// SPDX-License-Identifier: MPL-2.0

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use static_assertions::const_assert_eq;

use crate::sync::BusyLock;

/// The link that every record stored in a [`TwoLockQueue`] must embed,
/// at offset zero, so the queue can recover the full record from the
/// link and vice versa.
///
/// The link is atomic: on a single-element queue, a pop inspecting the
/// head's successor races with a push linking one, and the two sides
/// hold different locks.
#[repr(C)]
pub struct SingleListEntry {
    next: AtomicPtr<SingleListEntry>,
}

const_assert_eq!(
    core::mem::align_of::<SingleListEntry>(),
    core::mem::align_of::<*mut ()>()
);

impl SingleListEntry {
    /// Creates an unlinked entry.
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The next entry in the chain, or null at the end.
    ///
    /// Meaningful on chains returned by [`TwoLockQueue::flush`], which
    /// the caller walks front to back.
    pub fn next(&self) -> *mut SingleListEntry {
        self.next.load(Acquire)
    }
}

impl Default for SingleListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// An intrusive FIFO with one lock per end.
///
/// This is the two-lock queue of Michael and Scott ("Simple, Fast, and
/// Practical Non-Blocking and Blocking Concurrent Queue Algorithms"),
/// adjusted to run without the sentinel node the original requires:
/// transitions between the empty and non-empty states take both locks
/// instead. Steady-state push and pop on a multi-element queue touch
/// disjoint locks and do not contend.
///
/// The queue stores borrowed storage: callers own the records, hand
/// them over on [`push`](Self::push) and take them back from
/// [`pop`](Self::pop)/[`flush`](Self::flush). All three operations are
/// infallible.
pub struct TwoLockQueue {
    head_lock: BusyLock,
    head: UnsafeCell<*mut SingleListEntry>,
    tail_lock: BusyLock,
    tail: UnsafeCell<*mut SingleListEntry>,
}

// SAFETY: `head` is only accessed under `head_lock` and `tail` under
// `tail_lock`; entries are raw pointers whose ownership moves through
// the queue with the push/pop operations.
unsafe impl Send for TwoLockQueue {}
unsafe impl Sync for TwoLockQueue {}

impl TwoLockQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            head_lock: BusyLock::new(),
            head: UnsafeCell::new(ptr::null_mut()),
            tail_lock: BusyLock::new(),
            tail: UnsafeCell::new(ptr::null_mut()),
        }
    }

    /// Inserts `element` at the tail of the queue.
    ///
    /// # Safety
    ///
    /// The caller transfers ownership of the storage containing
    /// `element`. The entry must not currently be linked into any
    /// queue, and the storage must stay valid until the entry is
    /// returned by [`pop`](Self::pop) or [`flush`](Self::flush).
    pub unsafe fn push(&self, element: NonNull<SingleListEntry>) {
        let element = element.as_ptr();
        // SAFETY: we own the entry until it is linked; nobody else can
        // observe it yet.
        unsafe { (*element).next.store(ptr::null_mut(), Relaxed) };

        let _tail_guard = self.tail_lock.lock_exclusive();
        // SAFETY: `tail` is ours while the tail lock is held.
        let tail = unsafe { *self.tail.get() };
        if tail.is_null() {
            // Empty to non-empty transition; both ends move, so both
            // locks are required. No pop can be holding the head lock
            // and wanting the tail lock here: pop only reaches for the
            // tail after seeing a non-null head.
            let _head_guard = self.head_lock.lock_exclusive();
            // SAFETY: both locks held.
            unsafe {
                *self.head.get() = element;
                *self.tail.get() = element;
            }
        } else {
            // SAFETY: tail lock held; the old tail stays reachable.
            unsafe {
                (*tail).next.store(element, Release);
                *self.tail.get() = element;
            }
        }
    }

    /// Removes and returns the entry at the head of the queue, or
    /// `None` when the queue is empty.
    ///
    /// Ownership of the returned entry's storage moves back to the
    /// caller.
    pub fn pop(&self) -> Option<NonNull<SingleListEntry>> {
        let _head_guard = self.head_lock.lock_exclusive();
        // SAFETY: `head` is ours while the head lock is held.
        let head = unsafe { *self.head.get() };
        if head.is_null() {
            return None;
        }

        // SAFETY: a linked entry stays valid until popped; we hold the
        // head lock, so nobody else can pop it.
        let mut next = unsafe { (*head).next.load(Acquire) };
        if next.is_null() {
            // Possibly the last element. Taking the tail lock fences
            // out a push that is about to link a successor.
            let _tail_guard = self.tail_lock.lock_exclusive();
            // SAFETY: as above.
            next = unsafe { (*head).next.load(Acquire) };
            if next.is_null() {
                // SAFETY: both locks held for the non-empty to empty
                // transition.
                unsafe {
                    *self.head.get() = ptr::null_mut();
                    *self.tail.get() = ptr::null_mut();
                }
                return NonNull::new(head);
            }
            // A push slipped in; fall through and unlink normally.
        }
        // SAFETY: head lock held; `next` is reachable, so the queue
        // stays consistent.
        unsafe { *self.head.get() = next };
        NonNull::new(head)
    }

    /// Empties the queue and returns its former head.
    ///
    /// The caller walks the returned chain through
    /// [`SingleListEntry::next`]; the chain preserves FIFO order.
    /// Ownership of every entry in the chain moves back to the caller.
    pub fn flush(&self) -> Option<NonNull<SingleListEntry>> {
        let _head_guard = self.head_lock.lock_exclusive();
        let _tail_guard = self.tail_lock.lock_exclusive();

        // SAFETY: both locks held.
        let head = unsafe { *self.head.get() };
        unsafe {
            *self.head.get() = ptr::null_mut();
            *self.tail.get() = ptr::null_mut();
        }
        NonNull::new(head)
    }
}

impl Default for TwoLockQueue {
    fn default() -> Self {
        Self::new()
    }
}
