use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use conduit_stream::StreamConsumer;

use crate::app::dto::QueueStatus;
use crate::app::{errors, services::AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Prometheus text exposition.
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        conduit_observability::metrics::render(),
    )
}

/// GET /queue - Stream length, pending count and dead-letter depth
pub async fn queue(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let depth = match services.consumer.depth().await {
        Ok(depth) => depth,
        Err(e) => return errors::transport_error_to_response(e),
    };
    let dead_letters = match services.operator.depth().await {
        Ok(n) => n,
        Err(e) => return errors::operator_error_to_response(e),
    };

    Json(QueueStatus {
        stream: services.consumer.stream().to_string(),
        group: services.consumer.group().to_string(),
        length: depth.length,
        pending: depth.pending,
        dead_letters,
    })
    .into_response()
}
