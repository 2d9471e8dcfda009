//! Pipeline executor.

use std::sync::Arc;
use std::time::Instant;

use crate::context::{PipelineContext, PipelineResponse, ResponseSource};
use crate::error::{Hook, StageError};
use crate::stage::{ModelCall, Stage, StageFlow};

/// Name used for the model call in failure reports.
pub const MODEL_STAGE: &str = "model";

/// Result of a pipeline run.
#[derive(Debug)]
pub enum Outcome {
    Success(PipelineContext),
    Failure(StageError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Ordered stages around a terminal model call.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    model: Arc<dyn ModelCall>,
}

impl Pipeline {
    pub fn new(model: Arc<dyn ModelCall>) -> Self {
        Self {
            stages: Vec::new(),
            model,
        }
    }

    /// Append a stage; hooks run in registration order.
    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn push_stage(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Drive one context through every hook.
    ///
    /// The first hook error aborts the run. Effects already performed by
    /// earlier hooks are not undone.
    pub async fn run(&self, mut ctx: PipelineContext) -> Outcome {
        let started = Instant::now();
        let result = self.drive(&mut ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::debug!(
                    event_id = %ctx.event_id(),
                    short_circuit = ctx.response().is_some_and(|r| r.is_short_circuit()),
                    outbound = ctx.outbound().len(),
                    elapsed_ms,
                    "pipeline completed"
                );
                Outcome::Success(ctx)
            }
            Err(err) => {
                tracing::debug!(
                    event_id = %ctx.event_id(),
                    stage = %err.stage,
                    hook = err.hook.map(|h| h.as_str()),
                    kind = %err.kind,
                    elapsed_ms,
                    "pipeline failed"
                );
                Outcome::Failure(err)
            }
        }
    }

    async fn drive(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let short_circuit = self.run_before_hooks(ctx).await?;

        match short_circuit {
            Some(response) => ctx.set_response(response),
            None => {
                let output = match self.model.call(ctx).await {
                    Ok(output) => output,
                    Err(e) => return Err(e.at(MODEL_STAGE, Hook::ModelCall, ctx.source_metadata())),
                };
                ctx.set_response(PipelineResponse {
                    output,
                    source: ResponseSource::Model,
                });

                for stage in &self.stages {
                    if let Err(e) = stage.after_model_call(ctx).await {
                        return Err(e.at(stage.name(), Hook::AfterModelCall, ctx.source_metadata()));
                    }
                }
            }
        }

        for stage in &self.stages {
            if let Err(e) = stage.after_pipeline(ctx).await {
                return Err(e.at(stage.name(), Hook::AfterPipeline, ctx.source_metadata()));
            }
        }
        Ok(())
    }

    /// Runs every `before_pipeline`, then every `before_model_call`, stopping
    /// at the first short-circuit.
    async fn run_before_hooks(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<Option<PipelineResponse>, StageError> {
        for hook in [Hook::BeforePipeline, Hook::BeforeModelCall] {
            for stage in &self.stages {
                let flow = match hook {
                    Hook::BeforePipeline => stage.before_pipeline(ctx).await,
                    _ => stage.before_model_call(ctx).await,
                };
                match flow {
                    Ok(StageFlow::Continue) => {}
                    Ok(StageFlow::ShortCircuit(output)) => {
                        tracing::debug!(
                            event_id = %ctx.event_id(),
                            stage = stage.name(),
                            hook = hook.as_str(),
                            "pipeline short-circuited"
                        );
                        return Ok(Some(PipelineResponse {
                            output,
                            source: ResponseSource::ShortCircuit {
                                stage: stage.name().to_string(),
                            },
                        }));
                    }
                    Err(e) => return Err(e.at(stage.name(), hook, ctx.source_metadata())),
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModelOutput;
    use async_trait::async_trait;
    use chrono::Utc;
    use conduit_core::{Event, EventId};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        short_circuit_at: Option<Hook>,
        fail_at: Option<Hook>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                short_circuit_at: None,
                fail_at: None,
            }
        }

        fn hit(&self, hook: Hook) -> Result<(), StageError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}.{}", self.name, hook));
            if self.fail_at == Some(hook) {
                return Err(StageError::dependency("boom"));
            }
            Ok(())
        }

        fn flow(&self, hook: Hook) -> Result<StageFlow, StageError> {
            self.hit(hook)?;
            if self.short_circuit_at == Some(hook) {
                return Ok(StageFlow::ShortCircuit(ModelOutput::new("canned")));
            }
            Ok(StageFlow::Continue)
        }
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn before_pipeline(&self, _ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
            self.flow(Hook::BeforePipeline)
        }

        async fn before_model_call(&self, _ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
            self.flow(Hook::BeforeModelCall)
        }

        async fn after_model_call(&self, _ctx: &mut PipelineContext) -> Result<(), StageError> {
            self.hit(Hook::AfterModelCall)
        }

        async fn after_pipeline(&self, _ctx: &mut PipelineContext) -> Result<(), StageError> {
            self.hit(Hook::AfterPipeline)
        }
    }

    struct EchoModel {
        log: Log,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ModelCall for EchoModel {
        async fn call(&self, ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push("model".to_string());
            if self.fail {
                return Err(StageError::dependency("model unavailable"));
            }
            Ok(ModelOutput::new(ctx.event().payload_str().unwrap_or_default()))
        }
    }

    fn model(log: &Log, fail: bool) -> Arc<EchoModel> {
        Arc::new(EchoModel {
            log: Arc::clone(log),
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn ctx() -> PipelineContext {
        let mut ctx = PipelineContext::new(Event::new(EventId::new("7-0"), b"hello".to_vec(), Utc::now()), 1);
        ctx.tag("channel", "test");
        ctx
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn hooks_run_phase_by_phase_in_registration_order() {
        let log = Log::default();
        let pipeline = Pipeline::new(model(&log, false))
            .with_stage(Recorder::new("a", &log))
            .with_stage(Recorder::new("b", &log));

        let Outcome::Success(ctx) = pipeline.run(ctx()).await else {
            panic!("expected success");
        };

        assert_eq!(
            entries(&log),
            vec![
                "a.before_pipeline",
                "b.before_pipeline",
                "a.before_model_call",
                "b.before_model_call",
                "model",
                "a.after_model_call",
                "b.after_model_call",
                "a.after_pipeline",
                "b.after_pipeline",
            ]
        );
        let response = ctx.response().unwrap();
        assert_eq!(response.output.text, "hello");
        assert_eq!(response.source, ResponseSource::Model);
    }

    #[tokio::test]
    async fn short_circuit_skips_model_and_after_model_call_but_not_after_pipeline() {
        let log = Log::default();
        let model = model(&log, false);
        let mut guard = Recorder::new("a", &log);
        guard.short_circuit_at = Some(Hook::BeforePipeline);
        let pipeline = Pipeline::new(model.clone())
            .with_stage(guard)
            .with_stage(Recorder::new("b", &log));

        let Outcome::Success(ctx) = pipeline.run(ctx()).await else {
            panic!("expected success");
        };

        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            entries(&log),
            vec!["a.before_pipeline", "a.after_pipeline", "b.after_pipeline"]
        );
        let response = ctx.response().unwrap();
        assert_eq!(response.output.text, "canned");
        assert_eq!(
            response.source,
            ResponseSource::ShortCircuit { stage: "a".to_string() }
        );
    }

    #[tokio::test]
    async fn short_circuit_in_before_model_call_skips_later_before_hooks() {
        let log = Log::default();
        let mut cache = Recorder::new("a", &log);
        cache.short_circuit_at = Some(Hook::BeforeModelCall);
        let pipeline = Pipeline::new(model(&log, false))
            .with_stage(cache)
            .with_stage(Recorder::new("b", &log));

        assert!(pipeline.run(ctx()).await.is_success());
        assert_eq!(
            entries(&log),
            vec![
                "a.before_pipeline",
                "b.before_pipeline",
                "a.before_model_call",
                "a.after_pipeline",
                "b.after_pipeline",
            ]
        );
    }

    #[tokio::test]
    async fn hook_error_aborts_and_is_tagged() {
        let log = Log::default();
        let mut failing = Recorder::new("a", &log);
        failing.fail_at = Some(Hook::AfterModelCall);
        let pipeline = Pipeline::new(model(&log, false))
            .with_stage(failing)
            .with_stage(Recorder::new("b", &log));

        let Outcome::Failure(err) = pipeline.run(ctx()).await else {
            panic!("expected failure");
        };

        assert_eq!(err.stage, "a");
        assert_eq!(err.hook, Some(Hook::AfterModelCall));
        assert_eq!(err.kind, "dependency");
        assert_eq!(err.metadata["channel"], "test");
        assert!(!entries(&log).iter().any(|e| e.ends_with("after_pipeline")));
        assert!(!entries(&log).contains(&"b.after_model_call".to_string()));
    }

    #[tokio::test]
    async fn model_error_is_attributed_to_model() {
        let log = Log::default();
        let pipeline = Pipeline::new(model(&log, true)).with_stage(Recorder::new("a", &log));

        let Outcome::Failure(err) = pipeline.run(ctx()).await else {
            panic!("expected failure");
        };
        assert_eq!(err.stage, MODEL_STAGE);
        assert_eq!(err.hook, Some(Hook::ModelCall));
    }

    #[tokio::test]
    async fn empty_pipeline_just_calls_the_model() {
        let log = Log::default();
        let pipeline = Pipeline::new(model(&log, false));
        assert!(pipeline.is_empty());
        assert!(pipeline.run(ctx()).await.is_success());
        assert_eq!(entries(&log), vec!["model"]);
    }
}
