// SPDX-License-Identifier: MPL-2.0

//! Event dispatch over the thread pool.
//!
//! Events are dispatched to registered listeners either inline or
//! through a pool of workers; see [`EventBus`].

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use crate::platform;

mod bus;

pub use self::bus::EventBus;

/// Uniquely identifies a kind of event. Chosen by the event type.
pub type EventId = u32;

/// Uniquely identifies a registered listener within one bus.
///
/// Generated from the system entropy source on registration and
/// compared bytewise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId([u8; 16]);

impl ListenerId {
    pub(crate) fn generate() -> Self {
        Self(platform::random_uuid())
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

/// How [`EventBus::dispatch`] delivers an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DispatchMode {
    /// Deliver on the calling thread, before `dispatch` returns.
    /// Listeners run with the caller's stack; beware of held locks.
    Sync,
    /// Queue the event and deliver it on a pool worker later.
    Async,
    /// Let the bus pick: inline where the execution context permits it,
    /// queued otherwise.
    Auto,
}

/// An event that can be thrown on an [`EventBus`].
///
/// `Any` is a supertrait so listeners that know the concrete type can
/// downcast the payload.
pub trait Event: Any + Send + Sync {
    /// The stable identifier of this kind of event.
    fn event_id(&self) -> EventId;
}

/// A receiver of events.
///
/// Listeners are registered on a bus and invoked for every event
/// dispatched to it, from the dispatching thread or from a pool
/// worker. `on_event` must not unwind.
pub trait EventListener: Send + Sync {
    /// Handles one event.
    ///
    /// `bus` is the bus the event was thrown on; it is valid for the
    /// whole call and may be used to dispatch follow-up events.
    fn on_event(&self, event: &Arc<dyn Event>, bus: &EventBus);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_ids_are_distinct_and_stable() {
        let a = ListenerId::generate();
        let b = ListenerId::generate();
        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_eq!(a.as_bytes().len(), 16);
    }

    #[test]
    fn listener_id_debug_is_hyphenated() {
        let id = ListenerId([0; 16]);
        assert_eq!(
            format!("{:?}", id),
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
