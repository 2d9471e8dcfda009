//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Queue-assigned identifier of an event.
///
/// Opaque to the core: the stream backend decides the format (Redis uses
/// `<millis>-<seq>`). Ids are monotonic within a stream but carry no meaning
/// beyond equality here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for EventId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoreError::invalid_id("EventId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identifier of a dead-letter entry.
///
/// UUIDv7, so ids sort by the time the entry was created.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DlqId(Uuid);

impl DlqId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DlqId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for DlqId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for DlqId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<DlqId> for Uuid {
    fn from(value: DlqId) -> Self {
        value.0
    }
}

impl FromStr for DlqId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| CoreError::invalid_id(format!("DlqId: {}", e)))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_rejects_blank() {
        assert!("   ".parse::<EventId>().is_err());
        assert_eq!("17-0".parse::<EventId>().unwrap().as_str(), "17-0");
    }

    #[test]
    fn dlq_id_round_trips_through_display() {
        let id = DlqId::new();
        let parsed: DlqId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn dlq_ids_are_time_ordered() {
        let a = DlqId::new();
        let b = DlqId::new();
        assert!(a <= b);
    }
}
