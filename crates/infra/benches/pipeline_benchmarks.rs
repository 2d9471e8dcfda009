use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::{Event, EventId};
use conduit_infra::dlq::InMemoryDeadLetterStore;
use conduit_infra::orchestrator::{Orchestrator, OrchestratorConfig};
use conduit_infra::retry::{InMemoryRetryLedger, RetryDlqPolicy, RetryPolicy};
use conduit_pipeline::stages::{EmptyInputGuard, ReplyRouter};
use conduit_pipeline::{ModelCall, ModelOutput, Pipeline, PipelineContext, Stage, StageError};
use conduit_stream::{InMemoryStreams, StreamConsumer};
use tokio::runtime::Runtime;

struct StaticModel;

#[async_trait]
impl ModelCall for StaticModel {
    async fn call(&self, _ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
        Ok(ModelOutput::new("ok"))
    }
}

/// Touches every hook so the executor's dispatch cost is what gets measured.
struct Tagger(usize);

#[async_trait]
impl Stage for Tagger {
    fn name(&self) -> &str {
        "tagger"
    }

    async fn after_model_call(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        ctx.tag(format!("stage_{}", self.0), "seen");
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn message() -> Vec<u8> {
    br#"{"conversation_id":"bench","text":"how far is the moon?"}"#.to_vec()
}

fn bench_pipeline_run(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("pipeline_run");

    for stages in [0usize, 3, 10].iter() {
        let mut pipeline = Pipeline::new(Arc::new(StaticModel));
        for i in 0..*stages {
            pipeline = pipeline.with_stage(Tagger(i));
        }

        group.bench_with_input(BenchmarkId::new("stages", stages), stages, |b, _| {
            b.iter(|| {
                let ctx = PipelineContext::new(
                    Event::new(EventId::new("1-0"), message(), Utc::now()),
                    1,
                );
                black_box(rt.block_on(pipeline.run(ctx)).is_success());
            });
        });
    }

    group.finish();
}

fn bench_stream_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_stream");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("append_read_ack", batch_size),
            batch_size,
            |b, &size| {
                let streams = InMemoryStreams::new();
                let consumer = streams.consumer("bench", "group", "c1", Duration::from_millis(1));
                let payload = message();

                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..size {
                            streams.append("bench", &payload);
                        }
                        for _ in 0..size {
                            let delivery = consumer.read().await.unwrap().unwrap();
                            black_box(consumer.ack(delivery.event_id()).await.unwrap());
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_process_delivery(c: &mut Criterion) {
    let rt = runtime();
    let streams = InMemoryStreams::new();
    let consumer = streams.consumer("inbound", "group", "c1", Duration::from_millis(1));
    let pipeline = Pipeline::new(Arc::new(StaticModel))
        .with_stage(EmptyInputGuard::default())
        .with_stage(ReplyRouter::new("outbound"));
    let orchestrator = Orchestrator::new(
        Arc::new(consumer),
        Arc::new(streams.clone()),
        pipeline,
        RetryDlqPolicy::new(RetryPolicy::default(), Arc::new(InMemoryRetryLedger::default())),
        Arc::new(InMemoryDeadLetterStore::new()),
        OrchestratorConfig::default(),
    );
    let payload = message();

    c.bench_function("process_delivery_success", |b| {
        b.iter(|| {
            rt.block_on(async {
                streams.append("inbound", &payload);
                let delivery = orchestrator.consumer().read().await.unwrap().unwrap();
                black_box(orchestrator.process_delivery(delivery).await);
            })
        });
    });
}

criterion_group!(
    benches,
    bench_pipeline_run,
    bench_stream_throughput,
    bench_process_delivery
);
criterion_main!(benches);
