use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use conduit_infra::dlq::{DeadLetterEntry, DeadLetterFilter};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;

/// `GET /dlq` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub error_kind: Option<String>,
    pub failed_after: Option<DateTime<Utc>>,
    pub failed_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn filter(&self) -> DeadLetterFilter {
        DeadLetterFilter {
            error_kind: self.error_kind.clone(),
            failed_after: self.failed_after,
            failed_before: self.failed_before,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

/// A dead-letter entry as shown to operators. The payload is rendered as text
/// when it is valid UTF-8.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub dlq_id: String,
    pub original_event_id: String,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count_at_failure: u32,
    pub failed_at: DateTime<Utc>,
    pub source_metadata: BTreeMap<String, String>,
    pub payload: Option<String>,
    pub payload_bytes: usize,
}

impl From<DeadLetterEntry> for DeadLetterView {
    fn from(entry: DeadLetterEntry) -> Self {
        let payload_bytes = entry.payload.len();
        Self {
            dlq_id: entry.dlq_id.to_string(),
            original_event_id: entry.original_event_id.to_string(),
            error_kind: entry.error_kind,
            error_message: entry.error_message,
            retry_count_at_failure: entry.retry_count_at_failure,
            failed_at: entry.failed_at,
            source_metadata: entry.source_metadata,
            payload: String::from_utf8(entry.payload).ok(),
            payload_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub dlq_id: String,
    pub new_event_id: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct RetryStatus {
    pub event_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub exhausted: bool,
    /// Scheduled delay before the next retry, if one remains.
    pub next_delay_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub stream: String,
    pub group: String,
    pub length: u64,
    pub pending: u64,
    pub dead_letters: u64,
}
