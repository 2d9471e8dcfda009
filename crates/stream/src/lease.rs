//! Stale-lease reclamation.
//!
//! A consumer that crashes (or stalls) while holding an event leaves it pending
//! forever unless some other consumer claims it. [`LeaseManager`] wraps a
//! [`StreamConsumer`] and runs a background loop that periodically reclaims
//! every pending event idle for longer than the configured timeout. Reclaimed
//! deliveries are queued and handed out by `read()` ahead of new events, so
//! callers see a single stream of deliveries.
//!
//! An event holds at most one slot in the queue. Reclaiming it again while it
//! waits refreshes its lease and replaces the queued delivery instead of adding
//! a second copy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use conduit_core::EventId;

use crate::backoff::TransportBackoff;
use crate::consumer::StreamConsumer;
use crate::delivery::{AckOutcome, Delivery, StreamDepth};
use crate::error::TransportError;

const MIN_RECLAIM_INTERVAL: Duration = Duration::from_millis(1);

/// Reclamation settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a pending event may sit unacknowledged before it is reclaimed.
    pub idle_timeout: Duration,
    /// How often the reclaim loop runs.
    pub reclaim_interval: Duration,
    /// Capacity of the reclaimed-delivery queue.
    pub buffer: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(5),
            buffer: 64,
        }
    }
}

/// Reclaimed deliveries waiting for `read()`, at most one per event.
#[derive(Debug, Default)]
struct ReclaimQueue {
    deliveries: Mutex<VecDeque<Delivery>>,
}

impl ReclaimQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `delivery`, replacing a waiting delivery of the same event.
    /// Returns `false` when the event is new and the queue is full.
    fn offer(&self, delivery: Delivery, capacity: usize) -> bool {
        let mut queue = self.lock();
        if let Some(waiting) = queue
            .iter_mut()
            .find(|d| d.event_id() == delivery.event_id())
        {
            *waiting = delivery;
            return true;
        }
        if queue.len() >= capacity {
            return false;
        }
        queue.push_back(delivery);
        true
    }

    fn pop(&self) -> Option<Delivery> {
        self.lock().pop_front()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Stops a [`LeaseManager`]'s reclaim loop without owning the manager.
#[derive(Debug, Clone)]
pub struct ReclaimHandle {
    shutdown: Arc<watch::Sender<bool>>,
    queue: Arc<ReclaimQueue>,
}

impl ReclaimHandle {
    /// Stop reclaiming and drop queued deliveries. They stay pending in the
    /// group and are reclaimed by another consumer once idle.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.queue.clear();
    }
}

/// A [`StreamConsumer`] with background stale-lease reclamation.
pub struct LeaseManager<C> {
    inner: Arc<C>,
    config: LeaseConfig,
    queue: Arc<ReclaimQueue>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<C> LeaseManager<C>
where
    C: StreamConsumer + 'static,
{
    /// Wrap `consumer` and start the reclaim loop on the current runtime.
    pub fn start(consumer: C, config: LeaseConfig) -> Self {
        let inner = Arc::new(consumer);
        let queue = Arc::new(ReclaimQueue::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(reclaim_loop(
            Arc::clone(&inner),
            config.clone(),
            Arc::clone(&queue),
            shutdown_rx,
        ));

        Self {
            inner,
            config,
            queue,
            shutdown: Arc::new(shutdown),
            task: Some(task),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn reclaim_handle(&self) -> ReclaimHandle {
        ReclaimHandle {
            shutdown: Arc::clone(&self.shutdown),
            queue: Arc::clone(&self.queue),
        }
    }

    /// Stop the reclaim loop and wait for it to exit.
    ///
    /// Reclaimed deliveries still queued are dropped; they stay pending in the
    /// group and will be reclaimed again.
    pub async fn stop(mut self) {
        self.reclaim_handle().stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<C> Drop for LeaseManager<C> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn reclaim_loop<C>(
    consumer: Arc<C>,
    config: LeaseConfig,
    queue: Arc<ReclaimQueue>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: StreamConsumer + 'static,
{
    if config.reclaim_interval < MIN_RECLAIM_INTERVAL {
        tracing::warn!(
            stream = consumer.stream(),
            reclaim_interval_ms = config.reclaim_interval.as_millis() as u64,
            "reclaim interval too small, using 1ms"
        );
    }
    let mut ticker = tokio::time::interval(config.reclaim_interval.max(MIN_RECLAIM_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backoff = TransportBackoff::default();
    let capacity = config.buffer.max(1);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match consumer.reclaim_stale(config.idle_timeout).await {
            Ok(deliveries) => {
                backoff.reset();
                for delivery in deliveries {
                    let event_id = delivery.event_id().clone();
                    let delivery_count = delivery.delivery_count();
                    if !queue.offer(delivery, capacity) {
                        tracing::debug!(
                            stream = consumer.stream(),
                            event_id = %event_id,
                            "reclaim queue full, leaving event pending"
                        );
                        continue;
                    }
                    tracing::info!(
                        stream = consumer.stream(),
                        consumer = consumer.consumer_name(),
                        event_id = %event_id,
                        delivery_count,
                        "reclaimed stale lease"
                    );
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    stream = consumer.stream(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "stale lease reclamation failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    tracing::info!(
        stream = consumer.stream(),
        consumer = consumer.consumer_name(),
        "reclaim loop stopped"
    );
}

#[async_trait]
impl<C> StreamConsumer for LeaseManager<C>
where
    C: StreamConsumer + 'static,
{
    fn stream(&self) -> &str {
        self.inner.stream()
    }

    fn group(&self) -> &str {
        self.inner.group()
    }

    fn consumer_name(&self) -> &str {
        self.inner.consumer_name()
    }

    /// Reclaimed deliveries first, then new events from the stream.
    async fn read(&self) -> Result<Option<Delivery>, TransportError> {
        if let Some(delivery) = self.queue.pop() {
            return Ok(Some(delivery));
        }
        self.inner.read().await
    }

    async fn ack(&self, event_id: &EventId) -> Result<AckOutcome, TransportError> {
        self.inner.ack(event_id).await
    }

    async fn reclaim_stale(&self, idle: Duration) -> Result<Vec<Delivery>, TransportError> {
        self.inner.reclaim_stale(idle).await
    }

    async fn depth(&self) -> Result<StreamDepth, TransportError> {
        self.inner.depth().await
    }
}
