//! Worker pool around an [`Orchestrator`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use conduit_observability::metrics::try_record_transport_error;
use conduit_stream::TransportBackoff;

use super::{Orchestrator, ProcessOutcome};

/// Runtime counters shared by every worker.
#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    terminal: AtomicU64,
    transport_errors: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &ProcessOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Succeeded { .. } => &self.succeeded,
            ProcessOutcome::Retried { .. } => &self.retried,
            ProcessOutcome::DeadLettered { .. } => &self.dead_lettered,
            ProcessOutcome::Terminal => &self.terminal,
            ProcessOutcome::TransportFailure => &self.transport_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Orchestrator runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub terminal: u64,
    pub transport_errors: u64,
    pub in_flight: u64,
    pub workers: usize,
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    grace: Duration,
}

impl OrchestratorHandle {
    /// Stop reading, wait up to the shutdown grace for in-flight runs, then
    /// abort whatever is still running. Aborted events stay unacknowledged.
    ///
    /// Returns the number of workers that had to be aborted.
    pub async fn shutdown(mut self) -> usize {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + self.grace;
        let mut aborted = 0;

        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            tracing::warn!(aborted, "shutdown grace elapsed, aborted in-flight workers");
        } else {
            tracing::info!("orchestrator stopped");
        }
        aborted
    }

    pub fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            processed: c.processed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            terminal: c.terminal.load(Ordering::Relaxed),
            transport_errors: c.transport_errors.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            workers: self.workers.len(),
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Orchestrator {
    /// Spawn `workers` read/process loops on the current runtime.
    pub fn spawn(self, workers: usize) -> OrchestratorHandle {
        let orchestrator = Arc::new(self);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let grace = orchestrator.config.shutdown_grace;

        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&orchestrator),
                    shutdown_rx.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        OrchestratorHandle {
            shutdown,
            workers,
            counters,
            grace,
        }
    }
}

async fn worker_loop(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    let consumer = orchestrator.consumer();
    tracing::info!(
        worker,
        stream = consumer.stream(),
        group = consumer.group(),
        consumer = consumer.consumer_name(),
        "worker started"
    );
    let mut backoff = TransportBackoff::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = consumer.read() => read,
        };

        let delay = match read {
            Ok(None) => {
                backoff.reset();
                continue;
            }
            Ok(Some(delivery)) => {
                backoff.reset();
                counters.in_flight.fetch_add(1, Ordering::Relaxed);
                let outcome = orchestrator.process_delivery(delivery).await;
                counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                counters.record(&outcome);
                if outcome != ProcessOutcome::TransportFailure {
                    continue;
                }
                backoff.next_delay()
            }
            Err(e) => {
                counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                try_record_transport_error("read");
                let delay = backoff.next_delay();
                tracing::warn!(
                    worker,
                    error = %e,
                    failures = backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "stream read failed"
                );
                delay
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(worker, "worker stopped");
}
