use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::EventId;

/// An event read from a durable stream.
///
/// Immutable once written. The payload is an opaque byte blob: the core never
/// parses it, it only hands it to the pipeline (and to the dead-letter store
/// verbatim when processing permanently fails).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, payload: impl Into<Vec<u8>>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload: payload.into(),
            enqueued_at,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
