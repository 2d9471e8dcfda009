//! Operator actions over the dead-letter store.

use std::sync::Arc;

use conduit_core::{DlqId, EventId};
use conduit_observability::Metrics;
use conduit_stream::{Publisher, TransportError};

use super::entry::{DeadLetterEntry, DeadLetterFilter};
use super::store::{DeadLetterError, DeadLetterStore};

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(DlqId),
    #[error(transparent)]
    Store(#[from] DeadLetterError),
    #[error("publish failed: {0}")]
    Publish(#[from] TransportError),
}

/// Inspect, delete, purge and requeue dead-lettered events.
#[derive(Clone)]
pub struct DeadLetterOperator {
    store: Arc<dyn DeadLetterStore>,
    publisher: Arc<dyn Publisher>,
    primary_stream: String,
}

impl DeadLetterOperator {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        publisher: Arc<dyn Publisher>,
        primary_stream: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            primary_stream: primary_stream.into(),
        }
    }

    pub fn primary_stream(&self) -> &str {
        &self.primary_stream
    }

    pub async fn list(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, OperatorError> {
        Ok(self.store.list(filter, limit).await?)
    }

    pub async fn get(&self, id: DlqId) -> Result<DeadLetterEntry, OperatorError> {
        self.store
            .get(id)
            .await?
            .ok_or(OperatorError::NotFound(id))
    }

    pub async fn delete(&self, id: DlqId) -> Result<DeadLetterEntry, OperatorError> {
        let entry = self.store.take(id).await?.ok_or(OperatorError::NotFound(id))?;
        tracing::info!(dlq_id = %id, event_id = %entry.original_event_id, "dead-letter entry deleted");
        self.report_depth().await;
        Ok(entry)
    }

    /// Re-inject the entry's payload into the primary stream as a new event.
    ///
    /// The new event gets a fresh id and therefore a fresh retry budget. The
    /// entry is removed only after the publish succeeds, so an interrupted
    /// requeue can duplicate the payload but never lose it.
    pub async fn requeue(&self, id: DlqId) -> Result<EventId, OperatorError> {
        let entry = self.get(id).await?;

        let new_id = match self.publisher.publish(&self.primary_stream, &entry.payload).await {
            Ok(new_id) => new_id,
            Err(e) => {
                tracing::warn!(dlq_id = %id, error = %e, "requeue publish failed, entry kept");
                return Err(OperatorError::Publish(e));
            }
        };

        match self.store.take(id).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(
                dlq_id = %id,
                new_event_id = %new_id,
                "entry removed concurrently during requeue"
            ),
            Err(e) => tracing::error!(
                dlq_id = %id,
                new_event_id = %new_id,
                error = %e,
                "requeued payload published but entry could not be removed"
            ),
        }

        tracing::info!(
            dlq_id = %id,
            event_id = %entry.original_event_id,
            new_event_id = %new_id,
            stream = %self.primary_stream,
            "dead-letter entry requeued"
        );
        self.report_depth().await;
        Ok(new_id)
    }

    pub async fn purge(&self, filter: &DeadLetterFilter) -> Result<u64, OperatorError> {
        let removed = self.store.purge(filter).await?;
        tracing::info!(removed, ?filter, "dead-letter entries purged");
        self.report_depth().await;
        Ok(removed)
    }

    pub async fn depth(&self) -> Result<u64, OperatorError> {
        Ok(self.store.depth().await?)
    }

    /// Set the dead-letter depth gauge from the store.
    pub async fn report_depth(&self) {
        if let Some(metrics) = Metrics::get() {
            if let Ok(depth) = self.store.depth().await {
                metrics.set_dlq_depth(depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::store::InMemoryDeadLetterStore;
    use async_trait::async_trait;
    use conduit_stream::InMemoryStreams;
    use std::time::Duration;

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _stream: &str, _payload: &[u8]) -> Result<EventId, TransportError> {
            Err(TransportError::connection("down"))
        }
    }

    async fn seeded(store: &InMemoryDeadLetterStore) -> DlqId {
        store
            .append(DeadLetterEntry::new(
                EventId::new("9-0"),
                b"{\"conversation_id\":\"c\"}".to_vec(),
                "dependency",
                "db down",
                3,
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn requeue_publishes_identical_payload_as_new_event() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let streams = InMemoryStreams::new();
        let id = seeded(&store).await;
        let operator = DeadLetterOperator::new(store.clone(), Arc::new(streams.clone()), "inbound");

        let new_id = operator.requeue(id).await.unwrap();

        assert_ne!(new_id.as_str(), "9-0");
        assert_eq!(streams.payloads("inbound"), vec![b"{\"conversation_id\":\"c\"}".to_vec()]);
        assert_eq!(store.depth().await.unwrap(), 0);
        assert!(matches!(operator.requeue(id).await, Err(OperatorError::NotFound(_))));
    }

    struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _stream: &str, _payload: &[u8]) -> Result<EventId, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn interrupted_requeue_keeps_the_entry() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let id = seeded(&store).await;
        let operator = DeadLetterOperator::new(store.clone(), Arc::new(StalledPublisher), "inbound");

        // Dropping the future mid-publish stands in for a crash.
        let interrupted =
            tokio::time::timeout(Duration::from_millis(50), operator.requeue(id)).await;

        assert!(interrupted.is_err());
        assert_eq!(store.depth().await.unwrap(), 1);
        assert_eq!(operator.get(id).await.unwrap().payload, b"{\"conversation_id\":\"c\"}".to_vec());
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_entry() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let id = seeded(&store).await;
        let operator = DeadLetterOperator::new(store.clone(), Arc::new(FailingPublisher), "inbound");

        let err = operator.requeue(id).await.unwrap_err();

        assert!(matches!(err, OperatorError::Publish(_)));
        let restored = operator.get(id).await.unwrap();
        assert_eq!(restored.original_event_id.as_str(), "9-0");
        assert_eq!(restored.retry_count_at_failure, 3);
    }

    #[tokio::test]
    async fn delete_and_get_report_unknown_ids() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let id = seeded(&store).await;
        let operator = DeadLetterOperator::new(store, Arc::new(InMemoryStreams::new()), "inbound");

        assert_eq!(operator.delete(id).await.unwrap().dlq_id, id);
        assert!(matches!(operator.delete(id).await, Err(OperatorError::NotFound(_))));
        assert!(matches!(operator.get(DlqId::new()).await, Err(OperatorError::NotFound(_))));
    }
}
