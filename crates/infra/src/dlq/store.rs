//! Dead-letter storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use conduit_core::{DlqId, EventId};

use super::entry::{DeadLetterEntry, DeadLetterFilter};

/// Dead-letter store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Quarantine for events that exhausted their retries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store an entry. Appending a second entry for the same
    /// `original_event_id` returns the existing entry's id and stores nothing.
    async fn append(&self, entry: DeadLetterEntry) -> Result<DlqId, DeadLetterError>;

    async fn get(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Matching entries, oldest failure first, at most `limit`.
    async fn list(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// Atomically remove and return an entry.
    async fn take(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Remove every matching entry; returns how many were removed.
    async fn purge(&self, filter: &DeadLetterFilter) -> Result<u64, DeadLetterError>;

    async fn depth(&self) -> Result<u64, DeadLetterError>;
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<DlqId, DeadLetterEntry>,
    by_event: HashMap<EventId, DlqId>,
}

impl Entries {
    fn remove(&mut self, id: DlqId) -> Option<DeadLetterEntry> {
        let entry = self.by_id.remove(&id)?;
        if self.by_event.get(&entry.original_event_id) == Some(&id) {
            self.by_event.remove(&entry.original_event_id);
        }
        Some(entry)
    }

    fn sorted(&self, filter: &DeadLetterFilter) -> Vec<&DeadLetterEntry> {
        let mut matching: Vec<_> = self.by_id.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.dlq_id.cmp(&b.dlq_id)));
        matching
    }
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Entries>,
    unavailable: AtomicBool,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeadLetterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> Result<DlqId, DeadLetterError> {
        self.check()?;
        let mut entries = self.lock();
        if let Some(existing) = entries.by_event.get(&entry.original_event_id) {
            return Ok(*existing);
        }
        let id = entry.dlq_id;
        entries.by_event.insert(entry.original_event_id.clone(), id);
        entries.by_id.insert(id, entry);
        Ok(id)
    }

    async fn get(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.check()?;
        Ok(self.lock().by_id.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.check()?;
        Ok(self
            .lock()
            .sorted(filter)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn take(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.check()?;
        Ok(self.lock().remove(id))
    }

    async fn purge(&self, filter: &DeadLetterFilter) -> Result<u64, DeadLetterError> {
        self.check()?;
        let mut entries = self.lock();
        let ids: Vec<DlqId> = entries.sorted(filter).iter().map(|e| e.dlq_id).collect();
        for id in &ids {
            entries.remove(*id);
        }
        Ok(ids.len() as u64)
    }

    async fn depth(&self) -> Result<u64, DeadLetterError> {
        self.check()?;
        Ok(self.lock().by_id.len() as u64)
    }
}
