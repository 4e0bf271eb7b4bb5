// SPDX-License-Identifier: MPL-2.0

mod busy;
mod rundown;
mod signal;

pub use self::{
    busy::{BusyLock, BusyLockReadGuard, BusyLockWriteGuard},
    rundown::{RundownGuard, RundownProtection},
    signal::{Signal, WAIT_INFINITE},
};
