//! In-process broker with consumer-group semantics.
//!
//! Mirrors the parts of Redis Streams the service depends on: append-only
//! entries, per-group delivery cursors, a pending entries list with idle time
//! and delivery counts, and claim-on-idle. Used by tests and by the `memory`
//! backend for local runs.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use conduit_core::{Event, EventId};

use crate::consumer::{Publisher, StreamConsumer};
use crate::delivery::{AckOutcome, Delivery, StreamDepth};
use crate::error::TransportError;

const RECLAIM_BATCH: usize = 100;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    claimed_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: BTreeMap<u64, Event>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, payload: &[u8]) -> EventId {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = format_id(seq);
        self.entries
            .insert(seq, Event::new(id.clone(), payload.to_vec(), Utc::now()));
        id
    }
}

#[derive(Debug, Default)]
struct Shared {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    unavailable: AtomicBool,
}

/// Handle to a set of in-memory streams. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreams {
    shared: Arc<Shared>,
}

/// Snapshot of one pending entry, for assertions and operator views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub event_id: EventId,
    pub consumer: String,
    pub delivery_count: u32,
    pub idle: Duration,
}

impl InMemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a consumer, creating the stream and group on first use.
    ///
    /// A new group starts at the beginning of the stream.
    pub fn consumer(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        block_timeout: Duration,
    ) -> InMemoryConsumer {
        let stream = stream.into();
        let group = group.into();
        {
            let mut streams = self.lock();
            streams
                .entry(stream.clone())
                .or_default()
                .groups
                .entry(group.clone())
                .or_default();
        }
        InMemoryConsumer {
            streams: self.clone(),
            stream,
            group,
            name: name.into(),
            block_timeout,
        }
    }

    /// Append a payload, returning the new entry's id.
    pub fn append(&self, stream: &str, payload: &[u8]) -> EventId {
        let id = self
            .lock()
            .entry(stream.to_string())
            .or_default()
            .append(payload);
        self.shared.notify.notify_waiters();
        id
    }

    /// Number of entries held by `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    /// Payloads of every entry in `stream`, oldest first.
    pub fn payloads(&self, stream: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(stream)
            .map(|s| s.entries.values().map(|e| e.payload().to_vec()).collect())
            .unwrap_or_default()
    }

    /// Pending entries for `group` on `stream`, oldest first.
    pub fn pending_entries(&self, stream: &str, group: &str) -> Vec<PendingInfo> {
        let now = Instant::now();
        let streams = self.lock();
        let Some(group) = streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Vec::new();
        };
        group
            .pending
            .iter()
            .map(|(seq, p)| PendingInfo {
                event_id: format_id(*seq),
                consumer: p.consumer.clone(),
                delivery_count: p.delivery_count,
                idle: now.saturating_duration_since(p.claimed_at),
            })
            .collect()
    }

    /// Simulate a broker outage: while unavailable every operation fails with
    /// a connection error.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::connection("in-memory broker unavailable"));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Publisher for InMemoryStreams {
    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<EventId, TransportError> {
        self.check_available()?;
        Ok(self.append(stream, payload))
    }
}

/// One named consumer in a group of an [`InMemoryStreams`] stream.
#[derive(Debug, Clone)]
pub struct InMemoryConsumer {
    streams: InMemoryStreams,
    stream: String,
    group: String,
    name: String,
    block_timeout: Duration,
}

impl InMemoryConsumer {
    fn try_next(&self) -> Option<Delivery> {
        let mut streams = self.streams.lock();
        let state = streams.get_mut(&self.stream)?;
        let group = state.groups.entry(self.group.clone()).or_default();
        let (seq, event) = state
            .entries
            .range(group.last_delivered + 1..)
            .next()
            .map(|(seq, event)| (*seq, event.clone()))?;

        group.last_delivered = seq;
        group.pending.insert(
            seq,
            PendingEntry {
                consumer: self.name.clone(),
                claimed_at: Instant::now(),
                delivery_count: 1,
            },
        );
        Some(Delivery::new(event, 1))
    }
}

#[async_trait]
impl StreamConsumer for InMemoryConsumer {
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
        let deadline = Instant::now() + self.block_timeout;
        loop {
            let mut notified = pin!(self.streams.shared.notify.notified());
            notified.as_mut().enable();

            self.streams.check_available()?;
            if let Some(delivery) = self.try_next() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, event_id: &EventId) -> Result<AckOutcome, TransportError> {
        self.streams.check_available()?;
        let seq = parse_id(event_id)?;
        let mut streams = self.streams.lock();
        let removed = streams
            .get_mut(&self.stream)
            .and_then(|s| s.groups.get_mut(&self.group))
            .and_then(|g| g.pending.remove(&seq))
            .is_some();
        Ok(if removed {
            AckOutcome::Acknowledged
        } else {
            AckOutcome::AlreadyAcknowledged
        })
    }

    async fn reclaim_stale(&self, idle: Duration) -> Result<Vec<Delivery>, TransportError> {
        self.streams.check_available()?;
        let now = Instant::now();
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(&self.stream) else {
            return Ok(Vec::new());
        };
        let Some(group) = state.groups.get_mut(&self.group) else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        for (seq, pending) in group.pending.iter_mut() {
            if reclaimed.len() >= RECLAIM_BATCH {
                break;
            }
            if now.saturating_duration_since(pending.claimed_at) < idle {
                continue;
            }
            let Some(event) = state.entries.get(seq) else {
                continue;
            };
            pending.consumer = self.name.clone();
            pending.claimed_at = now;
            pending.delivery_count += 1;
            reclaimed.push(Delivery::new(event.clone(), pending.delivery_count));
        }
        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<StreamDepth, TransportError> {
        self.streams.check_available()?;
        let streams = self.streams.lock();
        let Some(state) = streams.get(&self.stream) else {
            return Ok(StreamDepth::default());
        };
        Ok(StreamDepth {
            length: state.entries.len() as u64,
            pending: state
                .groups
                .get(&self.group)
                .map_or(0, |g| g.pending.len() as u64),
        })
    }
}

fn format_id(seq: u64) -> EventId {
    EventId::new(format!("{seq}-0"))
}

fn parse_id(id: &EventId) -> Result<u64, TransportError> {
    id.as_str()
        .split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::protocol(format!("invalid stream id: {id}")))
}
