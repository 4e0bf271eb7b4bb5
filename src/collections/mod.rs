// SPDX-License-Identifier: MPL-2.0

mod two_lock_queue;

pub use self::two_lock_queue::{SingleListEntry, TwoLockQueue};
