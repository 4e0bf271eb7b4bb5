// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
///
/// Success is expressed as `Ok(_)`; there is no success variant here.
/// Invariant violations (counter underflow, double free, re-linking a node
/// that is already linked) are not errors: they panic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// An allocation failed after any permitted retries.
    NoMemory,
    /// A null, oversized or otherwise unusable argument was supplied.
    InvalidParameter,
    /// The entry being inserted is already present.
    AlreadyExists,
    /// The entry being looked up is not present.
    NotFound,
    /// The operation arrived after the subsystem began running down.
    RundownInProgress,
    /// The object is not in a state that allows the operation
    /// (e.g. re-running a thread before joining it).
    InvalidState,
    /// The host forbids the operation in the current execution context.
    UnsupportedContext,
    /// A timed wait elapsed without the condition being met.
    TimedOut,
}

/// A specialized [`Result`](core::result::Result) whose error is [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
