//! Dead-letter entry and filter types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conduit_core::{DlqId, EventId};

/// An event that exhausted its retry budget, with the failure that sent it here.
///
/// Immutable once written. Leaves the store only through an explicit requeue,
/// delete, or purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub dlq_id: DlqId,
    pub original_event_id: EventId,
    pub payload: Vec<u8>,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count_at_failure: u32,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub source_metadata: BTreeMap<String, String>,
}

impl DeadLetterEntry {
    pub fn new(
        original_event_id: EventId,
        payload: Vec<u8>,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
        retry_count_at_failure: u32,
    ) -> Self {
        Self {
            dlq_id: DlqId::new(),
            original_event_id,
            payload,
            error_kind: error_kind.into(),
            error_message: error_message.into(),
            retry_count_at_failure,
            failed_at: Utc::now(),
            source_metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.source_metadata.extend(metadata);
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = at;
        self
    }
}

/// Selects entries for listing and purging. Empty filter matches everything.
///
/// Time bounds are exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub failed_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_before: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn error_kind(kind: impl Into<String>) -> Self {
        Self {
            error_kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.error_kind
            .as_deref()
            .is_none_or(|kind| entry.error_kind == kind)
            && self.failed_after.is_none_or(|after| entry.failed_at > after)
            && self.failed_before.is_none_or(|before| entry.failed_at < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn filter_matches_kind_and_exclusive_window() {
        let t0 = Utc::now();
        let entry = DeadLetterEntry::new(EventId::new("1-0"), b"x".to_vec(), "timeout", "slow", 3)
            .failed_at(t0);

        assert!(DeadLetterFilter::all().matches(&entry));
        assert!(DeadLetterFilter::error_kind("timeout").matches(&entry));
        assert!(!DeadLetterFilter::error_kind("dependency").matches(&entry));

        let window = DeadLetterFilter {
            failed_after: Some(t0 - Duration::seconds(1)),
            failed_before: Some(t0 + Duration::seconds(1)),
            ..DeadLetterFilter::default()
        };
        assert!(window.matches(&entry));

        let exclusive = DeadLetterFilter {
            failed_after: Some(t0),
            ..DeadLetterFilter::default()
        };
        assert!(!exclusive.matches(&entry));
    }
}
