//! Redis Streams consumer group backend (durable, at-least-once delivery).
//!
//! - **Stream**: one Redis stream per inbound queue, entries carry `payload`
//!   and `enqueued_at` fields
//! - **Consumer group**: created on startup with `XGROUP CREATE … 0 MKSTREAM`
//! - **Reads**: `XREADGROUP … BLOCK` on a dedicated connection, one entry at a time
//! - **Reclamation**: `XPENDING … IDLE` to find stale leases, `XCLAIM` with the same
//!   min-idle so a lease refreshed in between is left alone
//! - **Ack**: `XACK`, where a reply of 0 means another consumer got there first

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::Value;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use conduit_core::{Event, EventId};
use conduit_stream::{AckOutcome, Delivery, Publisher, StreamConsumer, StreamDepth, TransportError};

use crate::redis_conn::{RedisConnection, map_redis_error};

/// Entries reclaimed per `reclaim_stale` call.
const RECLAIM_BATCH: usize = 100;

const PAYLOAD_FIELD: &str = "payload";
const ENQUEUED_AT_FIELD: &str = "enqueued_at";

/// One consumer in a Redis Streams consumer group.
pub struct RedisStreamConsumer {
    conn: Arc<RedisConnection>,
    read_conn: Mutex<Option<MultiplexedConnection>>,
    stream: String,
    group: String,
    name: String,
    block: Duration,
}

impl RedisStreamConsumer {
    /// Join (creating if needed) the consumer group and return a consumer.
    pub async fn connect(
        conn: Arc<RedisConnection>,
        stream: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        block: Duration,
    ) -> Result<Self, TransportError> {
        let consumer = Self {
            conn,
            read_conn: Mutex::new(None),
            stream: stream.into(),
            group: group.into(),
            name: name.into(),
            block,
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Create the group at the start of the stream. An existing group is fine.
    pub async fn ensure_group(&self) -> Result<(), TransportError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM");

        match self.conn.query::<()>(&cmd).await {
            Ok(()) => Ok(()),
            Err(TransportError::Command(msg)) if msg.contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut guard = self.read_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.conn.dedicated().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl StreamConsumer for RedisStreamConsumer {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<Option<Delivery>, TransportError> {
        let mut conn = self.read_connection().await?;
        let reply: Value = match redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err = map_redis_error(e);
                if err.is_connection() {
                    *self.read_conn.lock().await = None;
                }
                return Err(err);
            }
        };

        let entries = parse_read_reply(&reply)?;
        Ok(entries
            .into_iter()
            .next()
            .map(|entry| Delivery::new(entry.into_event(), 1)))
    }

    async fn ack(&self, event_id: &EventId) -> Result<AckOutcome, TransportError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.stream).arg(&self.group).arg(event_id.as_str());
        let acked: i64 = self.conn.query(&cmd).await?;
        Ok(if acked > 0 {
            AckOutcome::Acknowledged
        } else {
            AckOutcome::AlreadyAcknowledged
        })
    }

    async fn reclaim_stale(&self, idle: Duration) -> Result<Vec<Delivery>, TransportError> {
        let idle_ms = idle.as_millis() as u64;

        let mut pending_cmd = redis::cmd("XPENDING");
        pending_cmd
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(RECLAIM_BATCH);
        let pending: Vec<(String, String, u64, u64)> = self.conn.query(&pending_cmd).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let prior_deliveries: HashMap<&str, u64> = pending
            .iter()
            .map(|(id, _, _, count)| (id.as_str(), *count))
            .collect();

        let mut claim_cmd = redis::cmd("XCLAIM");
        claim_cmd
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.name)
            .arg(idle_ms);
        for (id, _, _, _) in &pending {
            claim_cmd.arg(id);
        }
        let claimed: Value = self.conn.query(&claim_cmd).await?;

        let deliveries = parse_entries(&claimed)?
            .into_iter()
            .map(|entry| {
                let count = prior_deliveries
                    .get(entry.id.as_str())
                    .map_or(2, |c| c.saturating_add(1));
                Delivery::new(entry.into_event(), u32::try_from(count).unwrap_or(u32::MAX))
            })
            .collect();
        Ok(deliveries)
    }

    async fn depth(&self) -> Result<StreamDepth, TransportError> {
        let mut len_cmd = redis::cmd("XLEN");
        len_cmd.arg(&self.stream);
        let length: u64 = self.conn.query(&len_cmd).await?;

        let mut pending_cmd = redis::cmd("XPENDING");
        pending_cmd.arg(&self.stream).arg(&self.group);
        let summary: Value = self.conn.query(&pending_cmd).await?;
        let pending = match summary {
            Value::Bulk(items) => match items.first() {
                Some(Value::Int(n)) => (*n).max(0) as u64,
                _ => 0,
            },
            _ => 0,
        };

        Ok(StreamDepth { length, pending })
    }
}

/// Appends events with `XADD`.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: Arc<RedisConnection>,
}

impl RedisStreamPublisher {
    pub fn new(conn: Arc<RedisConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<EventId, TransportError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(ENQUEUED_AT_FIELD)
            .arg(Utc::now().to_rfc3339());
        let id: String = self.conn.query(&cmd).await?;
        Ok(EventId::new(id))
    }
}

#[derive(Debug)]
struct RawEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl RawEntry {
    fn into_event(mut self) -> Event {
        let enqueued_at = self
            .fields
            .get(ENQUEUED_AT_FIELD)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| timestamp_from_id(&self.id))
            .unwrap_or_else(Utc::now);
        // A missing payload is delivered as empty so the pipeline rejects it
        // and it ends up dead-lettered instead of vanishing.
        let payload = self.fields.remove(PAYLOAD_FIELD).unwrap_or_default();
        Event::new(EventId::new(self.id), payload, enqueued_at)
    }
}

/// Stream ids are `<ms>-<seq>`.
fn timestamp_from_id(id: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = id.split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entry, …]], …]`.
fn parse_read_reply(reply: &Value) -> Result<Vec<RawEntry>, TransportError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => {
            return Err(TransportError::protocol(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    let mut entries = Vec::new();
    for stream in streams {
        match stream {
            Value::Bulk(parts) if parts.len() == 2 => entries.extend(parse_entries(&parts[1])?),
            other => {
                return Err(TransportError::protocol(format!(
                    "unexpected stream block: {other:?}"
                )));
            }
        }
    }
    Ok(entries)
}

/// `[[id, [field, value, …]], …]`. Nil entries (trimmed from the stream
/// while pending) are skipped.
fn parse_entries(value: &Value) -> Result<Vec<RawEntry>, TransportError> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(items) => items,
        other => {
            return Err(TransportError::protocol(format!(
                "unexpected entry list: {other:?}"
            )));
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let parts = match item {
            Value::Nil => continue,
            Value::Bulk(parts) if parts.len() == 2 => parts,
            other => {
                return Err(TransportError::protocol(format!(
                    "unexpected entry: {other:?}"
                )));
            }
        };

        let id = match &parts[0] {
            Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Status(s) => s.clone(),
            other => {
                return Err(TransportError::protocol(format!(
                    "unexpected entry id: {other:?}"
                )));
            }
        };

        let mut fields = HashMap::new();
        if let Value::Bulk(kv) = &parts[1] {
            for pair in kv.chunks(2) {
                if let [Value::Data(key), Value::Data(val)] = pair {
                    fields.insert(String::from_utf8_lossy(key).into_owned(), val.clone());
                }
            }
        }

        entries.push(RawEntry { id, fields });
    }
    Ok(entries)
}
