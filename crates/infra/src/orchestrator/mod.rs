//! Glue between the stream, the pipeline and the retry/dead-letter machinery.
//!
//! ## Per-delivery flow
//!
//! - Run the pipeline (bounded by `pipeline_timeout`)
//! - **Success**: publish outbound messages, clear the retry record, ack (last)
//! - **Failure**: record the failure in the ledger and either leave the event
//!   unacknowledged for redelivery, or append it to the dead-letter store,
//!   ack, and clear the record
//!
//! Transport failures (publish, ack, ledger) never ack and never count against
//! the retry budget beyond the increment already made.

mod handle;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::{DlqId, EventId};
use conduit_observability::Metrics;
use conduit_observability::metrics::try_record_transport_error;
use conduit_pipeline::{Outcome, Pipeline, PipelineContext, StageError};
use conduit_stream::{AckOutcome, Delivery, Publisher, StreamConsumer};

use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::retry::{Decision, RetryDlqPolicy};

pub use handle::{OrchestratorHandle, OrchestratorStats};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one pipeline run; exceeding it is a `timeout` failure.
    pub pipeline_timeout: Duration,
    /// Sleep for the scheduled backoff before moving on from a failed event.
    pub sleep_on_retry: bool,
    /// How long `shutdown` waits for in-flight runs.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout: Duration::from_secs(30),
            sleep_on_retry: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Pipeline succeeded and the event was acknowledged (or a faster
    /// consumer already had).
    Succeeded { late_ack: bool },
    /// Pipeline failed below the retry budget; the event stays pending.
    Retried { attempt: u32, delay: Duration },
    /// Retry budget spent; the event is in the dead-letter store and acked.
    DeadLettered { dlq_id: DlqId },
    /// The dead-letter append failed. The event stays pending and unacked.
    Terminal,
    /// Queue, ledger or publisher unreachable; the event stays pending.
    TransportFailure,
}

pub struct Orchestrator {
    consumer: Arc<dyn StreamConsumer>,
    publisher: Arc<dyn Publisher>,
    pipeline: Pipeline,
    policy: RetryDlqPolicy,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        consumer: Arc<dyn StreamConsumer>,
        publisher: Arc<dyn Publisher>,
        pipeline: Pipeline,
        policy: RetryDlqPolicy,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            consumer,
            publisher,
            pipeline,
            policy,
            dead_letters,
            config,
        }
    }

    pub fn consumer(&self) -> &Arc<dyn StreamConsumer> {
        &self.consumer
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one delivery through the pipeline and route the result.
    pub async fn process_delivery(&self, delivery: Delivery) -> ProcessOutcome {
        let delivery_count = delivery.delivery_count();
        let event = delivery.into_event();
        let event_id = event.id().clone();

        tracing::debug!(
            event_id = %event_id,
            delivery_count,
            consumer = self.consumer.consumer_name(),
            "processing event"
        );

        let ctx = PipelineContext::new(event.clone(), delivery_count);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.pipeline_timeout, self.pipeline.run(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failure(StageError::timeout(self.config.pipeline_timeout)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Success(ctx) => {
                if let Some(m) = Metrics::get() {
                    m.record_pipeline("success", elapsed);
                }
                self.complete(ctx).await
            }
            Outcome::Failure(err) => {
                if let Some(m) = Metrics::get() {
                    let label = if err.kind == "timeout" { "timeout" } else { "failure" };
                    m.record_pipeline(label, elapsed);
                    m.record_stage_failure(&err.stage, &err.kind);
                }
                self.fail(event.id(), event.payload(), delivery_count, err).await
            }
        }
    }

    async fn complete(&self, mut ctx: PipelineContext) -> ProcessOutcome {
        let event_id = ctx.event_id().clone();

        for message in ctx.take_outbound() {
            if let Err(e) = self.publisher.publish(&message.destination, &message.payload).await {
                tracing::warn!(
                    event_id = %event_id,
                    destination = %message.destination,
                    error = %e,
                    "outbound publish failed, leaving event pending"
                );
                try_record_transport_error("publish");
                return ProcessOutcome::TransportFailure;
            }
        }

        if let Err(e) = self.policy.record_success(&event_id).await {
            tracing::warn!(event_id = %event_id, error = %e, "failed to clear retry record");
            try_record_transport_error("ledger");
            return ProcessOutcome::TransportFailure;
        }

        match self.consumer.ack(&event_id).await {
            Ok(ack) => {
                let late_ack = ack == AckOutcome::AlreadyAcknowledged;
                if late_ack {
                    tracing::warn!(
                        event_id = %event_id,
                        "event already acknowledged by another consumer"
                    );
                }
                if let Some(m) = Metrics::get() {
                    m.events_processed.inc();
                }
                tracing::debug!(event_id = %event_id, "event acknowledged");
                ProcessOutcome::Succeeded { late_ack }
            }
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "ack failed");
                try_record_transport_error("ack");
                ProcessOutcome::TransportFailure
            }
        }
    }

    async fn fail(
        &self,
        event_id: &EventId,
        payload: &[u8],
        delivery_count: u32,
        err: StageError,
    ) -> ProcessOutcome {
        let decision = match self.policy.decide(event_id).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "retry ledger unavailable");
                try_record_transport_error("ledger");
                return ProcessOutcome::TransportFailure;
            }
        };

        match decision {
            Decision::Retry { attempt, delay } => {
                tracing::warn!(
                    event_id = %event_id,
                    delivery_count,
                    stage = %err.stage,
                    hook = err.hook.map(|h| h.as_str()),
                    kind = %err.kind,
                    retry_count = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "pipeline failed, event left pending for redelivery"
                );
                if let Some(m) = Metrics::get() {
                    m.events_retried.inc();
                }
                if self.config.sleep_on_retry && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                ProcessOutcome::Retried { attempt, delay }
            }
            Decision::DeadLetter { retry_count } => {
                self.dead_letter(event_id, payload, delivery_count, retry_count, err)
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        event_id: &EventId,
        payload: &[u8],
        delivery_count: u32,
        retry_count: u32,
        err: StageError,
    ) -> ProcessOutcome {
        let mut metadata = err.metadata.clone();
        metadata.extend(self.failure_metadata(delivery_count, &err));

        let entry = DeadLetterEntry::new(
            event_id.clone(),
            payload.to_vec(),
            err.kind.clone(),
            err.message.clone(),
            retry_count,
        )
        .with_metadata(metadata);

        let dlq_id = match self.dead_letters.append(entry).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    retry_count,
                    error = %e,
                    "dead-letter append failed, event left unacknowledged"
                );
                try_record_transport_error("dlq_append");
                return ProcessOutcome::Terminal;
            }
        };

        if let Err(e) = self.consumer.ack(event_id).await {
            tracing::warn!(event_id = %event_id, dlq_id = %dlq_id, error = %e, "ack after dead-letter failed");
            try_record_transport_error("ack");
            return ProcessOutcome::TransportFailure;
        }

        if let Err(e) = self.policy.record_success(event_id).await {
            // The record expires on its own TTL.
            tracing::warn!(event_id = %event_id, error = %e, "failed to clear retry record");
            try_record_transport_error("ledger");
        }

        tracing::warn!(
            event_id = %event_id,
            dlq_id = %dlq_id,
            retry_count,
            stage = %err.stage,
            kind = %err.kind,
            "event dead-lettered"
        );

        if let Some(m) = Metrics::get() {
            m.events_processed.inc();
            m.events_dead_lettered.inc();
            if let Ok(depth) = self.dead_letters.depth().await {
                m.set_dlq_depth(depth);
            }
        }

        ProcessOutcome::DeadLettered { dlq_id }
    }

    fn failure_metadata(&self, delivery_count: u32, err: &StageError) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("stream".to_string(), self.consumer.stream().to_string());
        metadata.insert("group".to_string(), self.consumer.group().to_string());
        metadata.insert("consumer".to_string(), self.consumer.consumer_name().to_string());
        metadata.insert("delivery_count".to_string(), delivery_count.to_string());
        metadata.insert("stage".to_string(), err.stage.clone());
        if let Some(hook) = err.hook {
            metadata.insert("hook".to_string(), hook.as_str().to_string());
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::Event;
    use conduit_pipeline::{ModelCall, ModelOutput, Stage};
    use conduit_stream::InMemoryStreams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::dlq::InMemoryDeadLetterStore;
    use crate::retry::{InMemoryRetryLedger, RetryLedger, RetryPolicy};

    struct Echo;

    #[async_trait]
    impl ModelCall for Echo {
        async fn call(&self, ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
            Ok(ModelOutput::new(ctx.event().payload_str().unwrap_or_default()))
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl ModelCall for Failing {
        async fn call(&self, _ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StageError::dependency("model down"))
        }
    }

    struct Slow;

    #[async_trait]
    impl ModelCall for Slow {
        async fn call(&self, _ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelOutput::new("late"))
        }
    }

    struct Forward;

    #[async_trait]
    impl Stage for Forward {
        fn name(&self) -> &str {
            "forward"
        }

        async fn after_pipeline(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
            if let Some(response) = ctx.response() {
                let text = response.output.text.clone();
                ctx.send("replies", text);
            }
            Ok(())
        }
    }

    struct Fixture {
        streams: InMemoryStreams,
        dlq: Arc<InMemoryDeadLetterStore>,
        ledger: Arc<InMemoryRetryLedger>,
        orchestrator: Orchestrator,
    }

    fn fixture(model: Arc<dyn ModelCall>, config: OrchestratorConfig) -> Fixture {
        let streams = InMemoryStreams::new();
        let consumer = streams.consumer("inbound", "workers", "c1", Duration::from_millis(20));
        let dlq = Arc::new(InMemoryDeadLetterStore::new());
        let ledger = Arc::new(InMemoryRetryLedger::default());
        let policy = RetryDlqPolicy::new(
            RetryPolicy::new(2, vec![Duration::from_millis(5)]),
            ledger.clone(),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(consumer),
            Arc::new(streams.clone()),
            Pipeline::new(model).with_stage(Forward),
            policy,
            dlq.clone(),
            config,
        );
        Fixture {
            streams,
            dlq,
            ledger,
            orchestrator,
        }
    }

    async fn next(f: &Fixture) -> Delivery {
        f.orchestrator.consumer().read().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_publishes_then_acks() {
        let f = fixture(Arc::new(Echo), OrchestratorConfig::default());
        f.streams.append("inbound", b"hello");

        let outcome = f.orchestrator.process_delivery(next(&f).await).await;

        assert_eq!(outcome, ProcessOutcome::Succeeded { late_ack: false });
        assert_eq!(f.streams.payloads("replies"), vec![b"hello".to_vec()]);
        assert!(f.streams.pending_entries("inbound", "workers").is_empty());
    }

    #[tokio::test]
    async fn publish_failure_leaves_event_pending() {
        let f = fixture(Arc::new(Echo), OrchestratorConfig::default());
        f.streams.append("inbound", b"hello");
        let delivery = next(&f).await;

        f.streams.set_available(false);
        let outcome = f.orchestrator.process_delivery(delivery).await;
        f.streams.set_available(true);

        assert_eq!(outcome, ProcessOutcome::TransportFailure);
        assert_eq!(f.streams.pending_entries("inbound", "workers").len(), 1);
        assert_eq!(f.ledger.get(&EventId::new("1-0")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failures_retry_then_dead_letter() {
        let model = Arc::new(Failing(AtomicUsize::new(0)));
        let f = fixture(model.clone(), OrchestratorConfig::default());
        f.streams.append("inbound", b"boom");
        let delivery = next(&f).await;

        let first = f.orchestrator.process_delivery(delivery.clone()).await;
        assert_eq!(
            first,
            ProcessOutcome::Retried {
                attempt: 1,
                delay: Duration::from_millis(5)
            }
        );
        assert_eq!(f.streams.pending_entries("inbound", "workers").len(), 1);

        let second = f
            .orchestrator
            .process_delivery(Delivery::new(delivery.event().clone(), 2))
            .await;
        let ProcessOutcome::DeadLettered { dlq_id } = second else {
            panic!("expected dead-letter, got {second:?}");
        };

        let entry = f.dlq.get(dlq_id).await.unwrap().unwrap();
        assert_eq!(entry.payload, b"boom".to_vec());
        assert_eq!(entry.retry_count_at_failure, 2);
        assert_eq!(entry.error_kind, "dependency");
        assert_eq!(entry.source_metadata.get("stage").map(String::as_str), Some("model"));
        assert_eq!(entry.source_metadata.get("hook").map(String::as_str), Some("model_call"));
        assert_eq!(entry.source_metadata.get("delivery_count").map(String::as_str), Some("2"));
        assert!(f.streams.pending_entries("inbound", "workers").is_empty());
        assert_eq!(f.ledger.get(delivery.event_id()).await.unwrap(), None);
        assert_eq!(model.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dead_letter_append_failure_is_terminal() {
        let f = fixture(Arc::new(Failing(AtomicUsize::new(0))), OrchestratorConfig::default());
        f.streams.append("inbound", b"boom");
        let delivery = next(&f).await;
        f.orchestrator.process_delivery(delivery.clone()).await;

        f.dlq.set_available(false);
        let outcome = f.orchestrator.process_delivery(delivery).await;

        assert_eq!(outcome, ProcessOutcome::Terminal);
        assert_eq!(f.streams.pending_entries("inbound", "workers").len(), 1);
    }

    #[tokio::test]
    async fn ledger_outage_is_a_transport_failure() {
        let f = fixture(Arc::new(Failing(AtomicUsize::new(0))), OrchestratorConfig::default());
        f.streams.append("inbound", b"boom");
        let delivery = next(&f).await;

        f.ledger.set_available(false);
        let outcome = f.orchestrator.process_delivery(delivery.clone()).await;
        f.ledger.set_available(true);

        assert_eq!(outcome, ProcessOutcome::TransportFailure);
        assert_eq!(f.ledger.get(delivery.event_id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn slow_pipeline_times_out_as_a_failure() {
        let f = fixture(
            Arc::new(Slow),
            OrchestratorConfig {
                pipeline_timeout: Duration::from_millis(20),
                ..OrchestratorConfig::default()
            },
        );
        f.streams.append("inbound", b"zzz");

        let outcome = f.orchestrator.process_delivery(next(&f).await).await;

        assert!(matches!(outcome, ProcessOutcome::Retried { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn event_payload_reaches_the_model_untouched() {
        let f = fixture(Arc::new(Echo), OrchestratorConfig::default());
        let event = Event::new(EventId::new("9-0"), b"direct".to_vec(), chrono::Utc::now());

        let outcome = f.orchestrator.process_delivery(Delivery::new(event, 1)).await;

        // Never read through the group, so the ack is a no-op.
        assert_eq!(outcome, ProcessOutcome::Succeeded { late_ack: true });
        assert_eq!(f.streams.payloads("replies"), vec![b"direct".to_vec()]);
    }
}
