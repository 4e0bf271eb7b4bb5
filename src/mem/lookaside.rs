// SPDX-License-Identifier: MPL-2.0

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::Relaxed;

use crate::collections::{SingleListEntry, TwoLockQueue};
use crate::platform;

/// Alignment of every block handed out by a lookaside allocator.
///
/// Covers the embedded [`SingleListEntry`] an idle block is reinterpreted
/// as, plus any fundamentally-aligned record a caller may place in it.
pub const BLOCK_ALIGNMENT: usize = 16;

/// Do not let a single allocator cache more than roughly this much.
const CACHE_BYTE_LIMIT: usize = 1024 * 1024;

/// Always cache at least this many blocks, however large they are.
const CACHE_MIN_ELEMENTS: usize = 5;

/// A cache of same-sized memory blocks.
///
/// Allocations are expensive; this allocator recycles freed blocks
/// through a [`TwoLockQueue`] instead of returning them to the system,
/// so the steady-state cost of an allocate/free pair is two queue
/// operations. While a block sits in the cache its first bytes are
/// reinterpreted as the queue link; once leased it is opaque caller
/// memory.
///
/// The cache is bounded: at most `max(5, 1 MiB / element_size)` blocks
/// are kept, tracked by a counter that is deliberately not transacted
/// with the queue operations. Under contention the counter may stray
/// past the bound by the number of in-flight frees; the bound is soft.
pub struct LookasideAllocator {
    free_list: TwoLockQueue,
    layout: Layout,
    max_elements: usize,
    cached_elements: AtomicU32,
    is_critical: bool,
}

// SAFETY: the queue is thread-safe and the remaining fields are either
// immutable after construction or atomic.
unsafe impl Send for LookasideAllocator {}
unsafe impl Sync for LookasideAllocator {}

impl LookasideAllocator {
    /// Creates an allocator for blocks of `element_size` bytes.
    ///
    /// Sizes smaller than the queue link are bumped up to it. When
    /// `is_critical` is set, fresh blocks come from the host's critical
    /// tier, which retries briefly before giving up.
    pub fn new(element_size: usize, is_critical: bool) -> Self {
        let element_size = element_size.max(core::mem::size_of::<SingleListEntry>());
        let layout = Layout::from_size_align(element_size, BLOCK_ALIGNMENT)
            .expect("unrepresentable lookaside element size");

        let max_elements = (CACHE_BYTE_LIMIT / element_size).max(CACHE_MIN_ELEMENTS);
        Self {
            free_list: TwoLockQueue::new(),
            layout,
            max_elements,
            cached_elements: AtomicU32::new(0),
            is_critical,
        }
    }

    /// The largest request this allocator can satisfy.
    pub fn element_size(&self) -> usize {
        self.layout.size()
    }

    /// The soft bound on the number of cached blocks.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Number of blocks currently sitting in the cache.
    pub fn cached_elements(&self) -> usize {
        self.cached_elements.load(Relaxed) as usize
    }

    /// Allocates a block of at least `block_size` bytes.
    ///
    /// Returns `None` when `block_size` exceeds the element size or the
    /// host allocator is exhausted. Recycled blocks carry whatever the
    /// previous owner left in them past the link prefix.
    pub fn allocate(&self, block_size: usize) -> Option<NonNull<u8>> {
        if block_size > self.layout.size() {
            return None;
        }

        if let Some(entry) = self.free_list.pop() {
            self.cached_elements.fetch_sub(1, Relaxed);
            return Some(entry.cast());
        }
        platform::allocate(self.layout, self.is_critical)
    }

    /// Returns a block to the allocator.
    ///
    /// While the cache is below its bound the block is recycled;
    /// otherwise it goes back to the system immediately.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate`](Self::allocate)
    /// on this allocator and must not be used afterwards.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        if (self.cached_elements.load(Relaxed) as usize) < self.max_elements {
            self.cached_elements.fetch_add(1, Relaxed);
            let entry: NonNull<SingleListEntry> = block.cast();
            // SAFETY: the block is at least entry-sized and aligned for
            // it, and the caller has handed its ownership back to us.
            unsafe {
                entry.as_ptr().write(SingleListEntry::new());
                self.free_list.push(entry);
            }
        } else {
            // SAFETY: allocated with this exact layout.
            unsafe { platform::deallocate(block, self.layout) };
        }
    }
}

impl Drop for LookasideAllocator {
    fn drop(&mut self) {
        let mut cursor = self
            .free_list
            .flush()
            .map_or(core::ptr::null_mut(), NonNull::as_ptr);
        while let Some(entry) = NonNull::new(cursor) {
            // SAFETY: every cached block is owned by the allocator and
            // was allocated with `self.layout`.
            cursor = unsafe { entry.as_ref().next() };
            unsafe { platform::deallocate(entry.cast(), self.layout) };
        }
        self.cached_elements.store(0, Relaxed);
    }
}
