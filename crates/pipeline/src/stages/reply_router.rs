use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::error::StageError;
use crate::message::{InboundMessage, OutboundReply};
use crate::stage::Stage;

/// Queues the response as an [`OutboundReply`] for publication.
///
/// The destination is the message's `reply_to` stream, or the router default.
#[derive(Debug, Clone)]
pub struct ReplyRouter {
    default_destination: String,
}

impl ReplyRouter {
    pub fn new(default_destination: impl Into<String>) -> Self {
        Self {
            default_destination: default_destination.into(),
        }
    }
}

#[async_trait]
impl Stage for ReplyRouter {
    fn name(&self) -> &str {
        "reply_router"
    }

    async fn after_pipeline(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let Some(text) = ctx.response().map(|r| r.output.text.clone()) else {
            return Ok(());
        };
        // No conversation to answer.
        if InboundMessage::is_blank(ctx.event().payload()) {
            return Ok(());
        }
        let message = InboundMessage::from_context(ctx)?.clone();
        let destination = message
            .reply_to
            .unwrap_or_else(|| self.default_destination.clone());
        let reply = OutboundReply {
            conversation_id: message.conversation_id,
            in_reply_to: ctx.event_id().to_string(),
            text,
        };
        let payload = serde_json::to_vec(&reply)
            .map_err(|e| StageError::new("serialization", e.to_string()))?;
        ctx.send(destination, payload);
        Ok(())
    }
}
