//! Per-event failure counts that outlive a single delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use conduit_core::EventId;

/// Retry ledger error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Failure counter keyed by event id.
///
/// Counts only grow until cleared. Every increment refreshes the record's TTL
/// so an abandoned record eventually expires on its own.
#[async_trait]
pub trait RetryLedger: Send + Sync {
    /// Atomically add one failure and return the new count.
    async fn increment(&self, event_id: &EventId) -> Result<u32, LedgerError>;

    async fn get(&self, event_id: &EventId) -> Result<Option<u32>, LedgerError>;

    /// Remove the record. Clearing an absent record succeeds.
    async fn clear(&self, event_id: &EventId) -> Result<(), LedgerError>;
}

#[derive(Debug)]
struct Record {
    count: u32,
    expires_at: Instant,
}

/// In-memory ledger for tests/dev.
#[derive(Debug)]
pub struct InMemoryRetryLedger {
    ttl: Duration,
    records: Mutex<HashMap<EventId, Record>>,
    unavailable: AtomicBool,
}

impl InMemoryRetryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a ledger outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("in-memory ledger offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryRetryLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(86_400))
    }
}

#[async_trait]
impl RetryLedger for InMemoryRetryLedger {
    async fn increment(&self, event_id: &EventId) -> Result<u32, LedgerError> {
        self.check()?;
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(event_id.clone()).or_insert(Record {
            count: 0,
            expires_at: now,
        });
        if record.count > 0 && record.expires_at <= now {
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.expires_at = now + self.ttl;
        Ok(record.count)
    }

    async fn get(&self, event_id: &EventId) -> Result<Option<u32>, LedgerError> {
        self.check()?;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(event_id)
            .filter(|r| r.expires_at > Instant::now())
            .map(|r| r.count))
    }

    async fn clear(&self, event_id: &EventId) -> Result<(), LedgerError> {
        self.check()?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn increments_then_clears() {
        let ledger = InMemoryRetryLedger::default();
        let id = EventId::new("1-0");

        assert_eq!(ledger.get(&id).await.unwrap(), None);
        assert_eq!(ledger.increment(&id).await.unwrap(), 1);
        assert_eq!(ledger.increment(&id).await.unwrap(), 2);
        assert_eq!(ledger.get(&id).await.unwrap(), Some(2));

        ledger.clear(&id).await.unwrap();
        ledger.clear(&id).await.unwrap();
        assert_eq!(ledger.get(&id).await.unwrap(), None);
        assert_eq!(ledger.increment(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_records_start_over() {
        let ledger = InMemoryRetryLedger::new(Duration::from_millis(20));
        let id = EventId::new("1-0");
        ledger.increment(&id).await.unwrap();
        ledger.increment(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ledger.get(&id).await.unwrap(), None);
        assert_eq!(ledger.increment(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outage_is_reported() {
        let ledger = InMemoryRetryLedger::default();
        ledger.set_available(false);
        let err = ledger.increment(&EventId::new("1-0")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }

    proptest! {
        #[test]
        fn counts_only_grow_until_cleared(ops in proptest::collection::vec(0u8..4, 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = InMemoryRetryLedger::default();
                let id = EventId::new("42-0");
                let mut expected = 0u32;
                for op in ops {
                    if op == 0 {
                        ledger.clear(&id).await.unwrap();
                        expected = 0;
                    } else {
                        let count = ledger.increment(&id).await.unwrap();
                        expected += 1;
                        assert_eq!(count, expected);
                    }
                    let stored = ledger.get(&id).await.unwrap().unwrap_or(0);
                    assert_eq!(stored, expected);
                }
            });
        }
    }
}
