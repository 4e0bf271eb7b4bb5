// SPDX-License-Identifier: MPL-2.0

mod lookaside;
pub mod split;

pub use self::lookaside::{LookasideAllocator, BLOCK_ALIGNMENT};
pub use self::split::{SplitAllocator, SplitAllocatorCritical};
