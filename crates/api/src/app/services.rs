//! Backend wiring for the `redis` and `memory` backends.

use std::sync::Arc;

use anyhow::Context;

use conduit_infra::config::{Backend, ConduitConfig};
use conduit_infra::conversation::PostgresConversationStore;
use conduit_infra::dlq::{
    DeadLetterOperator, DeadLetterStore, InMemoryDeadLetterStore, RedisDeadLetterStore,
};
use conduit_infra::model::HttpModelCall;
use conduit_infra::orchestrator::Orchestrator;
use conduit_infra::redis_conn::RedisConnection;
use conduit_infra::retry::{InMemoryRetryLedger, RedisRetryLedger, RetryDlqPolicy, RetryLedger};
use conduit_infra::stream::{RedisStreamConsumer, RedisStreamPublisher};
use conduit_pipeline::stages::{ConversationHistory, EmptyInputGuard, ReplyRouter};
use conduit_pipeline::{ConversationStore, InMemoryConversationStore, Pipeline};
use conduit_stream::{InMemoryStreams, LeaseManager, Publisher, ReclaimHandle, StreamConsumer};

/// Shared state for the operator routes.
#[derive(Clone)]
pub struct AppServices {
    pub operator: DeadLetterOperator,
    pub retries: RetryDlqPolicy,
    pub consumer: Arc<dyn StreamConsumer>,
}

/// Everything `main` needs: the operator services, an orchestrator ready
/// to spawn and the switch for lease reclamation.
pub struct Runtime {
    pub services: AppServices,
    pub orchestrator: Orchestrator,
    pub reclaim: ReclaimHandle,
}

struct Backends {
    consumer: Arc<dyn StreamConsumer>,
    reclaim: ReclaimHandle,
    publisher: Arc<dyn Publisher>,
    ledger: Arc<dyn RetryLedger>,
    dead_letters: Arc<dyn DeadLetterStore>,
}

pub async fn build_runtime(config: &ConduitConfig) -> anyhow::Result<Runtime> {
    let backends = match config.backend {
        Backend::Redis => redis_backends(config).await?,
        Backend::Memory => memory_backends(config),
    };

    let conversations = conversation_store(config).await?;
    let model = HttpModelCall::new(&config.model_url, config.pipeline_timeout)
        .context("failed to build model client")?;
    let pipeline = Pipeline::new(Arc::new(model))
        .with_stage(EmptyInputGuard::default())
        .with_stage(ConversationHistory::new(conversations, config.history_limit))
        .with_stage(ReplyRouter::new(&config.outbound_stream));
    tracing::info!(
        backend = ?config.backend,
        stream = %config.stream,
        group = %config.group,
        consumer = %config.consumer,
        stages = ?pipeline.stage_names(),
        "pipeline assembled"
    );

    let retries = RetryDlqPolicy::new(config.retry_policy(), backends.ledger);
    let operator = DeadLetterOperator::new(
        Arc::clone(&backends.dead_letters),
        Arc::clone(&backends.publisher),
        &config.stream,
    );
    // Entries left by earlier runs count from the first scrape.
    operator.report_depth().await;

    let orchestrator = Orchestrator::new(
        Arc::clone(&backends.consumer),
        backends.publisher,
        pipeline,
        retries.clone(),
        backends.dead_letters,
        config.orchestrator_config(),
    );

    Ok(Runtime {
        services: AppServices {
            operator,
            retries,
            consumer: backends.consumer,
        },
        orchestrator,
        reclaim: backends.reclaim,
    })
}

async fn redis_backends(config: &ConduitConfig) -> anyhow::Result<Backends> {
    let conn = Arc::new(
        RedisConnection::open(&config.redis_url)
            .with_context(|| format!("invalid redis url {}", config.redis_url))?,
    );
    let consumer = RedisStreamConsumer::connect(
        Arc::clone(&conn),
        &config.stream,
        &config.group,
        &config.consumer,
        config.block_timeout,
    )
    .await
    .context("failed to join consumer group")?;

    let leases = LeaseManager::start(consumer, config.lease_config());
    Ok(Backends {
        reclaim: leases.reclaim_handle(),
        consumer: Arc::new(leases),
        publisher: Arc::new(RedisStreamPublisher::new(Arc::clone(&conn))),
        ledger: Arc::new(RedisRetryLedger::new(
            Arc::clone(&conn),
            Some(config.ledger_prefix.clone()),
            config.ledger_ttl,
        )),
        dead_letters: Arc::new(RedisDeadLetterStore::new(conn, Some(config.dlq_key.clone()))),
    })
}

fn memory_backends(config: &ConduitConfig) -> Backends {
    tracing::warn!("using in-memory backend; nothing survives a restart");
    let streams = InMemoryStreams::new();
    let consumer = streams.consumer(
        &config.stream,
        &config.group,
        &config.consumer,
        config.block_timeout,
    );

    let leases = LeaseManager::start(consumer, config.lease_config());
    Backends {
        reclaim: leases.reclaim_handle(),
        consumer: Arc::new(leases),
        publisher: Arc::new(streams),
        ledger: Arc::new(InMemoryRetryLedger::new(config.ledger_ttl)),
        dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
    }
}

async fn conversation_store(config: &ConduitConfig) -> anyhow::Result<Arc<dyn ConversationStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresConversationStore::connect(url)
                .await
                .context("failed to connect to postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to create conversation schema")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; conversation history is in-memory");
            Ok(Arc::new(InMemoryConversationStore::new()))
        }
    }
}
