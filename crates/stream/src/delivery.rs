use serde::Serialize;

use conduit_core::{Event, EventId};

/// An event handed to a consumer, with its group-level delivery count.
///
/// `delivery_count` is 1 on first delivery and grows every time the lease is
/// reclaimed and the event redelivered. It is informational: the retry ledger,
/// not the delivery count, decides when an event is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    event: Event,
    delivery_count: u32,
}

impl Delivery {
    pub fn new(event: Event, delivery_count: u32) -> Self {
        Self {
            event,
            delivery_count,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_id(&self) -> &EventId {
        self.event.id()
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Whether this delivery came from lease reclamation rather than a first read.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

/// Result of an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The event was pending for the group and is now durably done.
    Acknowledged,
    /// The event was no longer pending (a faster consumer acked it first).
    /// This is a no-op, never an error.
    AlreadyAcknowledged,
}

/// Snapshot of a stream's size for operator inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamDepth {
    /// Entries currently held by the stream.
    pub length: u64,
    /// Entries delivered to the group but not yet acknowledged.
    pub pending: u64,
}
