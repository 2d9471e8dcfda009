use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    Json,
};

use conduit_core::EventId;

use crate::app::dto::RetryStatus;
use crate::app::{errors, services::AppServices};

/// GET /retries/:event_id - Current failure count for an event
pub async fn retry_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    let id = EventId::new(event_id);
    let retry_count = match services.retries.retry_count(&id).await {
        Ok(count) => count.unwrap_or(0),
        Err(e) => return errors::ledger_error_to_response(e),
    };

    let policy = services.retries.policy();
    let exhausted = !policy.should_retry(retry_count);
    let next_delay_ms = (!exhausted).then(|| policy.delay_for(retry_count + 1).as_millis() as u64);

    Json(RetryStatus {
        event_id: id.to_string(),
        retry_count,
        max_retries: policy.max_retries,
        exhausted,
        next_delay_ms,
    })
    .into_response()
}
