//! Postgres-backed conversation history.
//!
//! One row per processed event in `conversation_turns`, primary key
//! `event_id`. Writes are `INSERT … ON CONFLICT DO UPDATE`, so a redelivered
//! event rewrites its own row instead of adding a duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use conduit_core::EventId;
use conduit_pipeline::{ConversationError, ConversationStore, ConversationTurn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_turns (
    event_id        TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    user_text       TEXT NOT NULL,
    reply_text      TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS conversation_turns_by_conversation
    ON conversation_turns (conversation_id, created_at DESC);
"#;

#[derive(Clone)]
pub struct PostgresConversationStore {
    pool: PgPool,
}

impl PostgresConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, ConversationError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| ConversationError::Storage(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Create the table and index if missing.
    pub async fn ensure_schema(&self) -> Result<(), ConversationError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> ConversationError {
    ConversationError::Storage(e.to_string())
}

#[async_trait]
impl ConversationStore for PostgresConversationStore {
    async fn load_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ConversationError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, conversation_id, user_text, reply_text, created_at
            FROM (
                SELECT event_id, conversation_id, user_text, reply_text, created_at
                FROM conversation_turns
                WHERE conversation_id = $1
                ORDER BY created_at DESC, event_id DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, event_id ASC
            "#,
        )
        .bind(conversation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                Ok(ConversationTurn {
                    event_id: EventId::new(row.try_get::<String, _>("event_id").map_err(storage)?),
                    conversation_id: row.try_get("conversation_id").map_err(storage)?,
                    user_text: row.try_get("user_text").map_err(storage)?,
                    reply_text: row.try_get("reply_text").map_err(storage)?,
                    created_at: row
                        .try_get::<DateTime<Utc>, _>("created_at")
                        .map_err(storage)?,
                })
            })
            .collect()
    }

    async fn upsert_turn(&self, turn: ConversationTurn) -> Result<(), ConversationError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turns
                (event_id, conversation_id, user_text, reply_text, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO UPDATE SET
                conversation_id = EXCLUDED.conversation_id,
                user_text = EXCLUDED.user_text,
                reply_text = EXCLUDED.reply_text,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(turn.event_id.as_str())
        .bind(&turn.conversation_id)
        .bind(&turn.user_text)
        .bind(&turn.reply_text)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}
