// SPDX-License-Identifier: MPL-2.0

//! Concurrency and resource-management primitives for systems code.
//!
//! This crate is the core of a cross-platform systems toolkit aimed at
//! environments where exceptions are unavailable, allocation may fail
//! and every failure travels through explicit status values. It
//! provides, bottom up:
//!
//! - [`sync::BusyLock`]: a 16-bit spinning reader/writer lock.
//! - [`collections::TwoLockQueue`]: an intrusive FIFO with one lock per
//!   end, after Michael and Scott's two-lock algorithm (sentinel-free).
//! - [`sync::RundownProtection`]: a drain-and-block reference counter
//!   coordinating teardown against in-flight users.
//! - [`mem::LookasideAllocator`] and [`mem::split`]: recycling
//!   allocators for same-sized blocks.
//! - [`sync::Signal`] and [`thread::Thread`]: a manual/auto-reset event
//!   and a one-shot OS-thread wrapper.
//! - [`thread::work_queue::ThreadPool`]: a round-robin work dispatcher
//!   that grows with its workload.
//! - [`events::EventBus`]: a listener registry with sync/async dispatch
//!   layered on the pool.
//!
//! Fallible operations return [`Result`]; invariant violations panic.
//! Host services (allocation tiers, sleeping, time, entropy, critical
//! regions) are concentrated in [`platform`].

pub mod collections;
mod error;
pub mod events;
pub mod mem;
pub mod platform;
pub mod sync;
pub mod thread;

pub use self::error::{Error, Result};
