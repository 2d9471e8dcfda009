//! Stream consumption contract (mechanics only).
//!
//! A [`StreamConsumer`] is one named member of a consumer group reading a single
//! durable stream. The group, not the consumer, owns delivery state: every event
//! is delivered to exactly one active consumer at a time and stays *pending* for
//! the group until it is acknowledged.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: an event that is never acknowledged is redelivered once
//!   its lease goes stale and some consumer reclaims it
//! - **No cross-event ordering after redelivery**: first deliveries arrive in
//!   write order, but a reclaimed event may be processed after later ones
//! - **Idempotent processing required**: a consumer that stalls past the idle
//!   timeout can have its event reclaimed and processed a second time while it
//!   is still working; both may finish, and the first acknowledger wins
//!
//! ## Acknowledgment discipline
//!
//! `ack` is the only operation that marks an event durably done. Callers must
//! make it the last action on a successfully handled event, never a speculative
//! one. Acking an event that is no longer pending returns
//! [`AckOutcome::AlreadyAcknowledged`]: the loser of a reclamation race sees a
//! no-op, not an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conduit_core::EventId;

use crate::delivery::{AckOutcome, Delivery, StreamDepth};
use crate::error::TransportError;

/// One consumer in a consumer group.
///
/// ## Usage pattern
///
/// ```ignore
/// loop {
///     match consumer.read().await {
///         Ok(Some(delivery)) => {
///             if process(&delivery).await.is_ok() {
///                 consumer.ack(delivery.event_id()).await?;
///             }
///         }
///         Ok(None) => continue,                 // block timeout, check for shutdown
///         Err(e) => sleep(backoff.next_delay()), // transport error, not a message failure
///     }
/// }
/// ```
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Name of the stream this consumer reads.
    fn stream(&self) -> &str;

    /// Consumer group name.
    fn group(&self) -> &str;

    /// This consumer's name within the group.
    fn consumer_name(&self) -> &str;

    /// Wait (bounded by the backend's block timeout) for the next event.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to deliver.
    async fn read(&self) -> Result<Option<Delivery>, TransportError>;

    /// Remove an event from the group's pending set.
    async fn ack(&self, event_id: &EventId) -> Result<AckOutcome, TransportError>;

    /// Take over every pending event (of any consumer in the group) whose lease
    /// has been idle for at least `idle`, returning them with incremented
    /// delivery counts.
    async fn reclaim_stale(&self, idle: Duration) -> Result<Vec<Delivery>, TransportError>;

    /// Current stream length and pending count.
    async fn depth(&self) -> Result<StreamDepth, TransportError>;
}

#[async_trait]
impl<C> StreamConsumer for Arc<C>
where
    C: StreamConsumer + ?Sized,
{
    fn stream(&self) -> &str {
        (**self).stream()
    }

    fn group(&self) -> &str {
        (**self).group()
    }

    fn consumer_name(&self) -> &str {
        (**self).consumer_name()
    }

    async fn read(&self) -> Result<Option<Delivery>, TransportError> {
        (**self).read().await
    }

    async fn ack(&self, event_id: &EventId) -> Result<AckOutcome, TransportError> {
        (**self).ack(event_id).await
    }

    async fn reclaim_stale(&self, idle: Duration) -> Result<Vec<Delivery>, TransportError> {
        (**self).reclaim_stale(idle).await
    }

    async fn depth(&self) -> Result<StreamDepth, TransportError> {
        (**self).depth().await
    }
}

/// Appends events to named streams.
///
/// Used for outbound replies after a successful pipeline run and for
/// re-injecting dead-lettered payloads. Every publish creates a brand-new event
/// with a fresh id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<EventId, TransportError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<EventId, TransportError> {
        (**self).publish(stream, payload).await
    }
}
