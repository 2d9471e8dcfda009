//! Prometheus metrics for the consumer process.
//!
//! One process-wide set of collectors, registered on the default registry the
//! first time [`Metrics::init`] is called. Library code records through
//! [`Metrics::get`] and stays silent when metrics were never initialised.

use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram_vec,
};
use thiserror::Error;

static METRICS: OnceLock<Metrics> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
#[error("metrics registration failed for {name}: {source}")]
pub struct MetricsError {
    name: &'static str,
    #[source]
    source: prometheus::Error,
}

fn named(name: &'static str) -> impl FnOnce(prometheus::Error) -> MetricsError {
    move |source| MetricsError { name, source }
}

pub struct Metrics {
    /// Events that reached a final routing decision.
    pub events_processed: Counter,

    /// Failed runs left unacknowledged for redelivery.
    pub events_retried: Counter,

    /// Events moved to the dead-letter store.
    pub events_dead_lettered: Counter,

    /// Queue/ledger/store transport failures (by operation).
    pub transport_errors: CounterVec,

    /// Entries currently held by the dead-letter store.
    pub dlq_depth: Gauge,

    /// Pipeline run duration (by outcome).
    pub pipeline_duration_seconds: HistogramVec,

    /// Stage failures (by stage, kind).
    pub stage_failures: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup). Repeated calls return the
    /// same instance.
    pub fn init() -> Result<&'static Metrics, MetricsError> {
        let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            events_processed: register_counter!(
                "conduit_events_processed_total",
                "Events that reached a final routing decision"
            )
            .map_err(named("events_processed"))?,

            events_retried: register_counter!(
                "conduit_events_retried_total",
                "Failed runs left unacknowledged for redelivery"
            )
            .map_err(named("events_retried"))?,

            events_dead_lettered: register_counter!(
                "conduit_events_dead_lettered_total",
                "Events moved to the dead-letter store"
            )
            .map_err(named("events_dead_lettered"))?,

            transport_errors: register_counter_vec!(
                "conduit_transport_errors_total",
                "Transport-level failures by operation",
                &["operation"]
            )
            .map_err(named("transport_errors"))?,

            dlq_depth: register_gauge!(
                "conduit_dlq_depth",
                "Entries currently in the dead-letter store"
            )
            .map_err(named("dlq_depth"))?,

            pipeline_duration_seconds: register_histogram_vec!(
                "conduit_pipeline_duration_seconds",
                "Pipeline run duration",
                &["outcome"],
                vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            )
            .map_err(named("pipeline_duration_seconds"))?,

            stage_failures: register_counter_vec!(
                "conduit_stage_failures_total",
                "Pipeline failures by stage and kind",
                &["stage", "kind"]
            )
            .map_err(named("stage_failures"))?,
        };

        Ok(METRICS.get_or_init(|| metrics))
    }

    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_pipeline(&self, outcome: &str, elapsed: Duration) {
        self.pipeline_duration_seconds
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_stage_failure(&self, stage: &str, kind: &str) {
        self.stage_failures.with_label_values(&[stage, kind]).inc();
    }

    pub fn record_transport_error(&self, operation: &str) {
        self.transport_errors.with_label_values(&[operation]).inc();
    }

    pub fn set_dlq_depth(&self, depth: u64) {
        self.dlq_depth.set(depth as f64);
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Record a transport error if metrics are initialised.
pub fn try_record_transport_error(operation: &str) {
    if let Some(m) = Metrics::get() {
        m.record_transport_error(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_renders() {
        let first = Metrics::init().unwrap();
        let second = Metrics::init().unwrap();
        assert!(std::ptr::eq(first, second));

        first.events_processed.inc();
        first.record_stage_failure("history", "dependency");
        first.record_pipeline("success", Duration::from_millis(12));
        first.set_dlq_depth(4);

        let text = render();
        assert!(text.contains("conduit_events_processed_total"));
        assert!(text.contains(r#"conduit_stage_failures_total{kind="dependency",stage="history"}"#));
        assert!(text.contains("conduit_dlq_depth 4"));
    }
}
