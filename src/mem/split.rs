// SPDX-License-Identifier: MPL-2.0

//! Size-class frontend over a bank of lookaside allocators.
//!
//! One lookaside per size class keeps small allocations from leaning on
//! the host allocator: a request is served by the smallest class that
//! fits it, and anything beyond the largest class goes straight to the
//! system. Each block carries a small header recording where it came
//! from, so freeing routes back to its origin in O(1).

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use lazy_static::lazy_static;
use static_assertions::{const_assert, const_assert_eq};

use crate::mem::lookaside::{LookasideAllocator, BLOCK_ALIGNMENT};
use crate::platform;

/// The size classes, smallest first.
const TIER_SIZES: [usize; 5] = [64, 512, 4096, 32768, 262144];

/// Tier index stored for blocks that bypassed the bank.
const SYSTEM_TIER: u32 = u32::MAX;

const_assert!(TIER_SIZES[0] < TIER_SIZES[1]);
const_assert!(TIER_SIZES[1] < TIER_SIZES[2]);
const_assert!(TIER_SIZES[2] < TIER_SIZES[3]);
const_assert!(TIER_SIZES[3] < TIER_SIZES[4]);

/// Prefix written at the start of every block handed out by this
/// module. The user pointer sits right behind it, so the header size
/// must preserve [`BLOCK_ALIGNMENT`].
#[repr(C)]
struct BlockHeader {
    /// Total size of the underlying block, header included.
    total_size: u64,
    /// Index into [`TIER_SIZES`], or [`SYSTEM_TIER`].
    tier: u32,
    _reserved: u32,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const_assert_eq!(HEADER_SIZE, BLOCK_ALIGNMENT);

struct SplitAllocatorBank {
    tiers: [LookasideAllocator; TIER_SIZES.len()],
    is_critical: bool,
}

impl SplitAllocatorBank {
    fn new(is_critical: bool) -> Self {
        Self {
            tiers: TIER_SIZES.map(|size| LookasideAllocator::new(size, is_critical)),
            is_critical,
        }
    }

    fn allocate(&self, block_size: usize) -> Option<NonNull<u8>> {
        if block_size == 0 {
            return None;
        }
        let total_size = block_size.checked_add(HEADER_SIZE)?;

        let (tier, block) = match TIER_SIZES.iter().position(|&size| total_size <= size) {
            Some(index) => (index as u32, self.tiers[index].allocate(total_size)?),
            None => {
                // Too big for the bank; the system serves it directly.
                let layout = Layout::from_size_align(total_size, BLOCK_ALIGNMENT).ok()?;
                (SYSTEM_TIER, platform::allocate(layout, self.is_critical)?)
            }
        };

        let header = block.cast::<BlockHeader>().as_ptr();
        // SAFETY: the block is at least header-sized and freshly owned.
        unsafe {
            header.write(BlockHeader {
                total_size: total_size as u64,
                tier,
                _reserved: 0,
            });
        }
        // SAFETY: total_size > HEADER_SIZE, so the offset stays in bounds.
        Some(unsafe { NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)) })
    }

    /// # Safety
    ///
    /// `block` must have come from [`allocate`](Self::allocate) on this
    /// bank and must not be used afterwards.
    unsafe fn free(&self, block: NonNull<u8>) {
        // SAFETY: every block we hand out is preceded by its header.
        let base = unsafe { block.as_ptr().sub(HEADER_SIZE) };
        let header = unsafe { base.cast::<BlockHeader>().read() };
        let base = NonNull::new(base).expect("split allocator header at null");

        if header.tier == SYSTEM_TIER {
            let layout = Layout::from_size_align(header.total_size as usize, BLOCK_ALIGNMENT)
                .expect("corrupt split allocator header");
            // SAFETY: allocated by `platform::allocate` with this layout.
            unsafe { platform::deallocate(base, layout) };
        } else {
            // SAFETY: allocated from this tier.
            unsafe { self.tiers[header.tier as usize].free(base) };
        }
    }
}

lazy_static! {
    static ref BANK: SplitAllocatorBank = SplitAllocatorBank::new(false);
    static ref CRITICAL_BANK: SplitAllocatorBank = SplitAllocatorBank::new(true);
}

fn bank(critical: bool) -> &'static SplitAllocatorBank {
    if critical {
        &CRITICAL_BANK
    } else {
        &BANK
    }
}

/// Allocates `block_size` bytes through the split allocator.
///
/// Returns `None` for zero-sized requests and on host-allocator
/// exhaustion.
pub fn allocate(block_size: usize, critical: bool) -> Option<NonNull<u8>> {
    bank(critical).allocate(block_size)
}

/// Frees a block obtained from [`allocate`].
///
/// # Safety
///
/// `block` must have come from [`allocate`] with the same `critical`
/// flag and must not be used afterwards.
pub unsafe fn free(block: NonNull<u8>, critical: bool) {
    // SAFETY: forwarded caller contract.
    unsafe { bank(critical).free(block) };
}

/// Best-effort allocation front, for callers that tolerate failure.
#[derive(Clone, Copy, Default)]
pub struct SplitAllocator;

impl SplitAllocator {
    /// See [`allocate`].
    pub fn allocate_memory(block_size: usize) -> Option<NonNull<u8>> {
        allocate(block_size, false)
    }

    /// See [`free`].
    ///
    /// # Safety
    ///
    /// Same contract as [`free`] with `critical = false`.
    pub unsafe fn free_memory(block: NonNull<u8>) {
        unsafe { free(block, false) };
    }
}

/// Must-not-fail-in-steady-state allocation front.
#[derive(Clone, Copy, Default)]
pub struct SplitAllocatorCritical;

impl SplitAllocatorCritical {
    /// See [`allocate`].
    pub fn allocate_memory(block_size: usize) -> Option<NonNull<u8>> {
        allocate(block_size, true)
    }

    /// See [`free`].
    ///
    /// # Safety
    ///
    /// Same contract as [`free`] with `critical = true`.
    pub unsafe fn free_memory(block: NonNull<u8>) {
        unsafe { free(block, true) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_all_size_classes() {
        for &size in &[1, 48, 63, 64, 500, 4000, 30_000, 200_000, 1_000_000] {
            let block = allocate(size, false).unwrap();
            // The block is writable over its whole requested extent.
            unsafe {
                core::ptr::write_bytes(block.as_ptr(), 0xAB, size);
                free(block, false);
            }
        }
    }

    #[test]
    fn rejects_zero_sized_requests() {
        assert!(allocate(0, false).is_none());
    }

    #[test]
    fn freed_blocks_are_recycled_by_their_tier() {
        // A private bank: the global ones are shared with the other
        // tests running in parallel.
        let bank = SplitAllocatorBank::new(false);
        let first = bank.allocate(100).unwrap();
        unsafe { bank.free(first) };
        let second = bank.allocate(100).unwrap();
        // Same class, and the cache returned the same storage.
        assert_eq!(first.as_ptr(), second.as_ptr());
        unsafe { bank.free(second) };
    }

    #[test]
    fn alignment_is_preserved_behind_the_header() {
        for &size in &[1, 64, 100_000, 500_000] {
            let block = allocate(size, true).unwrap();
            assert_eq!(block.as_ptr() as usize % BLOCK_ALIGNMENT, 0);
            unsafe { free(block, true) };
        }
    }

    #[test]
    fn wrappers_route_to_their_banks() {
        let block = SplitAllocator::allocate_memory(128).unwrap();
        unsafe { SplitAllocator::free_memory(block) };

        let block = SplitAllocatorCritical::allocate_memory(128).unwrap();
        unsafe { SplitAllocatorCritical::free_memory(block) };
    }
}
