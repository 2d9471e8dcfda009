//! Stage and model-call contracts.

use async_trait::async_trait;

use crate::context::{ModelOutput, PipelineContext};
use crate::error::StageError;

/// What a before-hook wants the executor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    /// Skip the remaining before-hooks, the model call and every
    /// `after_model_call`; use this output as the response.
    ShortCircuit(ModelOutput),
}

/// A named unit of work with four lifecycle hooks.
///
/// Every hook defaults to a no-op, so a stage implements only what it needs.
/// Stages are registered once and invoked for many events; per-event state
/// belongs in the [`PipelineContext`], not in the stage.
///
/// Hooks may perform external effects. The executor never rolls them back and
/// an event can be processed more than once, so those effects must be
/// idempotent (key writes by event id).
///
/// # Example
///
/// ```ignore
/// struct Tagger;
///
/// #[async_trait]
/// impl Stage for Tagger {
///     fn name(&self) -> &str { "tagger" }
///
///     async fn before_pipeline(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
///         ctx.tag("channel", "telegram");
///         Ok(StageFlow::Continue)
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn before_pipeline(&self, _ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        Ok(StageFlow::Continue)
    }

    async fn before_model_call(&self, _ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        Ok(StageFlow::Continue)
    }

    async fn after_model_call(&self, _ctx: &mut PipelineContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Runs for every stage exactly once per successful run, short-circuited
    /// or not.
    async fn after_pipeline(&self, _ctx: &mut PipelineContext) -> Result<(), StageError> {
        Ok(())
    }
}

/// The terminal step of a pipeline (the LLM call, in production).
#[async_trait]
pub trait ModelCall: Send + Sync {
    async fn call(&self, ctx: &PipelineContext) -> Result<ModelOutput, StageError>;
}
