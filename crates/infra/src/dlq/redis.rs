//! Redis-backed dead-letter store.
//!
//! Three keys under one hash tag so the Lua scripts stay single-slot:
//!
//! - `{base}:entries` hash, `dlq_id → entry JSON`
//! - `{base}:index` sorted set, `dlq_id` scored by `failed_at` (ms)
//! - `{base}:by_event` hash, `original_event_id → dlq_id`

use std::sync::Arc;

use async_trait::async_trait;

use conduit_core::DlqId;
use conduit_stream::TransportError;

use super::entry::{DeadLetterEntry, DeadLetterFilter};
use super::store::{DeadLetterError, DeadLetterStore};
use crate::redis_conn::RedisConnection;

const DEFAULT_KEY: &str = "conduit:dlq";
const HMGET_CHUNK: usize = 200;

const APPEND_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[3], ARGV[2])
if existing then
  return existing
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[1])
return ARGV[1]
"#;

const TAKE_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return false
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
local entry = cjson.decode(raw)
if redis.call('HGET', KEYS[3], entry['original_event_id']) == ARGV[1] then
  redis.call('HDEL', KEYS[3], entry['original_event_id'])
end
return raw
"#;

#[derive(Clone)]
pub struct RedisDeadLetterStore {
    conn: Arc<RedisConnection>,
    entries_key: String,
    index_key: String,
    by_event_key: String,
    append_script: Arc<redis::Script>,
    take_script: Arc<redis::Script>,
}

impl RedisDeadLetterStore {
    pub fn new(conn: Arc<RedisConnection>, base_key: Option<String>) -> Self {
        let base = base_key.unwrap_or_else(|| DEFAULT_KEY.to_string());
        Self {
            conn,
            entries_key: format!("{{{base}}}:entries"),
            index_key: format!("{{{base}}}:index"),
            by_event_key: format!("{{{base}}}:by_event"),
            append_script: Arc::new(redis::Script::new(APPEND_SCRIPT)),
            take_script: Arc::new(redis::Script::new(TAKE_SCRIPT)),
        }
    }

    async fn take_raw(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let mut invocation = self.take_script.prepare_invoke();
        invocation
            .key(&self.entries_key)
            .key(&self.index_key)
            .key(&self.by_event_key)
            .arg(id.to_string());
        let raw: Option<String> = self.conn.invoke(&invocation).await.map_err(store_error)?;
        raw.map(|r| decode(&r)).transpose()
    }

    /// Ids in the filter's time window, oldest first.
    async fn window_ids(&self, filter: &DeadLetterFilter) -> Result<Vec<String>, DeadLetterError> {
        let min = filter
            .failed_after
            .map_or_else(|| "-inf".to_string(), |t| format!("({}", t.timestamp_millis()));
        let max = filter
            .failed_before
            .map_or_else(|| "+inf".to_string(), |t| format!("({}", t.timestamp_millis()));

        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(&self.index_key).arg(min).arg(max);
        self.conn.query(&cmd).await.map_err(store_error)
    }

    async fn matching(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let ids = self.window_ids(filter).await?;
        let mut out = Vec::new();
        for chunk in ids.chunks(HMGET_CHUNK) {
            let mut cmd = redis::cmd("HMGET");
            cmd.arg(&self.entries_key).arg(chunk);
            let raws: Vec<Option<String>> = self.conn.query(&cmd).await.map_err(store_error)?;
            for raw in raws.into_iter().flatten() {
                let entry = decode(&raw)?;
                // Score bounds are millisecond-precise; recheck exactly.
                if filter.matches(&entry) {
                    out.push(entry);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn store_error(e: TransportError) -> DeadLetterError {
    if e.is_connection() {
        DeadLetterError::Unavailable(e.to_string())
    } else {
        DeadLetterError::Storage(e.to_string())
    }
}

fn decode(raw: &str) -> Result<DeadLetterEntry, DeadLetterError> {
    serde_json::from_str(raw).map_err(|e| DeadLetterError::Serialization(e.to_string()))
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> Result<DlqId, DeadLetterError> {
        let json =
            serde_json::to_string(&entry).map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

        let mut invocation = self.append_script.prepare_invoke();
        invocation
            .key(&self.entries_key)
            .key(&self.index_key)
            .key(&self.by_event_key)
            .arg(entry.dlq_id.to_string())
            .arg(entry.original_event_id.as_str())
            .arg(entry.failed_at.timestamp_millis())
            .arg(json);
        let stored: String = self.conn.invoke(&invocation).await.map_err(store_error)?;

        stored
            .parse()
            .map_err(|_| DeadLetterError::Storage(format!("invalid dlq id in store: {stored}")))
    }

    async fn get(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(&self.entries_key).arg(id.to_string());
        let raw: Option<String> = self.conn.query(&cmd).await.map_err(store_error)?;
        raw.map(|r| decode(&r)).transpose()
    }

    async fn list(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.matching(filter, limit).await
    }

    async fn take(&self, id: DlqId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.take_raw(id).await
    }

    async fn purge(&self, filter: &DeadLetterFilter) -> Result<u64, DeadLetterError> {
        let mut removed = 0;
        for entry in self.matching(filter, usize::MAX).await? {
            if self.take_raw(entry.dlq_id).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn depth(&self) -> Result<u64, DeadLetterError> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(&self.index_key);
        self.conn.query(&cmd).await.map_err(store_error)
    }
}
