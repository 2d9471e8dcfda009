//! JSON shapes decoded and produced by the built-in stages.
//!
//! The executor treats payloads as opaque; only stages that need the message
//! content call [`InboundMessage::from_context`].

use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;
use crate::error::StageError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    UserMessage,
    ReminderTrigger,
}

/// An inbound user message or scheduled-reminder trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    /// Destination stream for the reply; the router's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl InboundMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, StageError> {
        serde_json::from_slice(payload)
            .map_err(|e| StageError::invalid_payload(format!("inbound message: {e}")))
    }

    /// A payload with nothing but whitespace carries no message to decode.
    pub fn is_blank(payload: &[u8]) -> bool {
        payload.trim_ascii().is_empty()
    }

    /// Decode the event payload once per run and cache it in the context.
    pub fn from_context(ctx: &mut PipelineContext) -> Result<&InboundMessage, StageError> {
        if ctx.get::<InboundMessage>().is_none() {
            let message = Self::decode(ctx.event().payload())?;
            ctx.tag("conversation_id", message.conversation_id.clone());
            ctx.insert(message);
        }
        ctx.get::<InboundMessage>()
            .ok_or_else(|| StageError::invalid_payload("inbound message missing from context"))
    }
}

/// The reply published for a processed inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub conversation_id: String,
    pub in_reply_to: String,
    pub text: String,
}
