//! Conversation history persistence interface.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use conduit_core::EventId;

/// One user/assistant exchange, keyed by the event that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub event_id: EventId,
    pub conversation_id: String,
    pub user_text: String,
    pub reply_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Read and idempotent write access to conversation history.
///
/// `upsert_turn` must be keyed by `event_id`: writing the same turn twice
/// (redelivery) leaves exactly one row.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The latest `limit` turns, oldest first.
    async fn load_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ConversationError>;

    async fn upsert_turn(&self, turn: ConversationTurn) -> Result<(), ConversationError>;
}

/// In-memory history (tests and the `memory` backend).
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    turns: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total turns stored for a conversation.
    pub fn count(&self, conversation_id: &str) -> usize {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ConversationError> {
        let turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(all) = turns.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }

    async fn upsert_turn(&self, turn: ConversationTurn) -> Result<(), ConversationError> {
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        let conversation = turns.entry(turn.conversation_id.clone()).or_default();
        match conversation.iter_mut().find(|t| t.event_id == turn.event_id) {
            Some(existing) => *existing = turn,
            None => {
                conversation.push(turn);
                conversation.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.event_id.cmp(&b.event_id))
                });
            }
        }
        Ok(())
    }
}
