use async_trait::async_trait;

use crate::context::{ModelOutput, PipelineContext};
use crate::error::StageError;
use crate::message::{InboundMessage, MessageKind};
use crate::stage::{Stage, StageFlow};

/// Answers blank user messages with a canned reply instead of calling the model.
///
/// An empty payload counts as a blank message. Reminder triggers carry no
/// text and always pass.
#[derive(Debug, Clone)]
pub struct EmptyInputGuard {
    reply: String,
}

impl EmptyInputGuard {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl Default for EmptyInputGuard {
    fn default() -> Self {
        Self::new("I didn't catch that. Could you say it again?")
    }
}

#[async_trait]
impl Stage for EmptyInputGuard {
    fn name(&self) -> &str {
        "empty_input_guard"
    }

    async fn before_pipeline(&self, ctx: &mut PipelineContext) -> Result<StageFlow, StageError> {
        if InboundMessage::is_blank(ctx.event().payload()) {
            return Ok(StageFlow::ShortCircuit(ModelOutput::new(self.reply.clone())));
        }
        let message = InboundMessage::from_context(ctx)?;
        if message.kind == MessageKind::UserMessage && message.text.trim().is_empty() {
            return Ok(StageFlow::ShortCircuit(ModelOutput::new(self.reply.clone())));
        }
        Ok(StageFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conduit_core::{Event, EventId};

    fn ctx(payload: &str) -> PipelineContext {
        PipelineContext::new(Event::new(EventId::new("1-0"), payload.as_bytes().to_vec(), Utc::now()), 1)
    }

    #[tokio::test]
    async fn blank_text_short_circuits() {
        let guard = EmptyInputGuard::new("say again");
        let flow = guard
            .before_pipeline(&mut ctx(r#"{"conversation_id":"c","text":"   "}"#))
            .await
            .unwrap();
        assert_eq!(flow, StageFlow::ShortCircuit(ModelOutput::new("say again")));
    }

    #[tokio::test]
    async fn real_text_and_triggers_continue() {
        let guard = EmptyInputGuard::default();
        let flow = guard
            .before_pipeline(&mut ctx(r#"{"conversation_id":"c","text":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(flow, StageFlow::Continue);

        let flow = guard
            .before_pipeline(&mut ctx(r#"{"conversation_id":"c","kind":"reminder_trigger"}"#))
            .await
            .unwrap();
        assert_eq!(flow, StageFlow::Continue);
    }

    #[tokio::test]
    async fn empty_payload_short_circuits() {
        let guard = EmptyInputGuard::new("say again");
        for payload in ["", "  \n"] {
            let flow = guard.before_pipeline(&mut ctx(payload)).await.unwrap();
            assert_eq!(flow, StageFlow::ShortCircuit(ModelOutput::new("say again")));
        }
    }

    #[tokio::test]
    async fn undecodable_payload_fails() {
        let err = EmptyInputGuard::default()
            .before_pipeline(&mut ctx("not json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_payload");
    }
}
