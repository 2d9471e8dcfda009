//! Redis-backed retry ledger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conduit_core::EventId;
use conduit_stream::TransportError;

use super::ledger::{LedgerError, RetryLedger};
use crate::redis_conn::RedisConnection;

const DEFAULT_PREFIX: &str = "conduit:retries";

/// Ledger stored as one integer key per event: `{prefix}:{event_id}`.
///
/// `INCR` and `EXPIRE` run in a single `MULTI`/`EXEC`, so concurrent failures
/// from different consumers never lose an increment.
#[derive(Clone)]
pub struct RedisRetryLedger {
    conn: Arc<RedisConnection>,
    prefix: String,
    ttl: Duration,
}

impl RedisRetryLedger {
    pub fn new(conn: Arc<RedisConnection>, prefix: Option<String>, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            ttl,
        }
    }

    fn key(&self, event_id: &EventId) -> String {
        format!("{}:{}", self.prefix, event_id)
    }
}

fn ledger_error(e: TransportError) -> LedgerError {
    if e.is_connection() {
        LedgerError::Unavailable(e.to_string())
    } else {
        LedgerError::Storage(e.to_string())
    }
}

#[async_trait]
impl RetryLedger for RedisRetryLedger {
    async fn increment(&self, event_id: &EventId) -> Result<u32, LedgerError> {
        let key = self.key(event_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs().max(1))
            .ignore();

        let (count,): (u32,) = self.conn.query_pipe(&pipe).await.map_err(ledger_error)?;
        Ok(count)
    }

    async fn get(&self, event_id: &EventId) -> Result<Option<u32>, LedgerError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.key(event_id));
        self.conn.query(&cmd).await.map_err(ledger_error)
    }

    async fn clear(&self, event_id: &EventId) -> Result<(), LedgerError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.key(event_id));
        let _: i64 = self.conn.query(&cmd).await.map_err(ledger_error)?;
        Ok(())
    }
}
