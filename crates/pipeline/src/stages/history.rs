use std::sync::Arc;

use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::conversation::{ConversationStore, ConversationTurn};
use crate::error::StageError;
use crate::message::InboundMessage;
use crate::stage::{Stage, StageFlow};

/// Prior turns loaded for the current conversation, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History(pub Vec<ConversationTurn>);

/// Loads recent history before the model call and records the exchange after.
///
/// The write is keyed by event id, so a redelivered event overwrites its own
/// turn instead of appending a duplicate. Short-circuited runs are not recorded.
pub struct ConversationHistory {
    store: Arc<dyn ConversationStore>,
    limit: usize,
}

impl ConversationHistory {
    pub fn new(store: Arc<dyn ConversationStore>, limit: usize) -> Self {
        Self { store, limit }
    }
}

#[async_trait]
impl Stage for ConversationHistory {
    fn name(&self) -> &str {
        "conversation_history"
    }

    async fn before_model_call(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        let conversation_id = InboundMessage::from_context(ctx)?.conversation_id.clone();
        let turns = self
            .store
            .load_recent(&conversation_id, self.limit)
            .await
            .map_err(|e| StageError::dependency(e.to_string()))?;
        ctx.insert(History(turns));
        Ok(StageFlow::Continue)
    }

    async fn after_pipeline(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let Some(response) = ctx.response() else {
            return Ok(());
        };
        if response.is_short_circuit() {
            return Ok(());
        }
        let reply_text = response.output.text.clone();
        let message = InboundMessage::from_context(ctx)?.clone();

        let turn = ConversationTurn {
            event_id: ctx.event_id().clone(),
            conversation_id: message.conversation_id,
            user_text: message.text,
            reply_text,
            created_at: ctx.event().enqueued_at(),
        };
        self.store
            .upsert_turn(turn)
            .await
            .map_err(|e| StageError::dependency(e.to_string()))?;
        ctx.record_side_effect("conversation turn upserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ModelOutput, PipelineResponse, ResponseSource};
    use crate::conversation::InMemoryConversationStore;
    use chrono::Utc;
    use conduit_core::{Event, EventId};

    fn ctx(id: &str) -> PipelineContext {
        let payload = br#"{"conversation_id":"c1","text":"hello"}"#.to_vec();
        PipelineContext::new(Event::new(EventId::new(id), payload, Utc::now()), 1)
    }

    fn answered(mut ctx: PipelineContext, source: ResponseSource) -> PipelineContext {
        ctx.set_response(PipelineResponse {
            output: ModelOutput::new("hi there"),
            source,
        });
        ctx
    }

    #[tokio::test]
    async fn loads_history_then_records_exchange_once() {
        let store = Arc::new(InMemoryConversationStore::new());
        let stage = ConversationHistory::new(store.clone(), 10);

        for _ in 0..2 {
            let mut ctx = ctx("5-0");
            stage.before_model_call(&mut ctx).await.unwrap();
            let mut ctx = answered(ctx, ResponseSource::Model);
            stage.after_pipeline(&mut ctx).await.unwrap();
            assert_eq!(ctx.side_effects().len(), 1);
        }
        assert_eq!(store.count("c1"), 1);

        let mut next = ctx("6-0");
        stage.before_model_call(&mut next).await.unwrap();
        let history = next.get::<History>().unwrap();
        assert_eq!(history.0.len(), 1);
        assert_eq!(history.0[0].reply_text, "hi there");
    }

    #[tokio::test]
    async fn short_circuit_is_not_recorded() {
        let store = Arc::new(InMemoryConversationStore::new());
        let stage = ConversationHistory::new(store.clone(), 10);

        let mut ctx = answered(
            ctx("5-0"),
            ResponseSource::ShortCircuit {
                stage: "empty_input_guard".to_string(),
            },
        );
        stage.after_pipeline(&mut ctx).await.unwrap();
        assert_eq!(store.count("c1"), 0);
    }
}
