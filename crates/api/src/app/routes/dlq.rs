//! Dead-letter inspection and recovery.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use conduit_core::DlqId;
use conduit_infra::dlq::DeadLetterFilter;

use crate::app::dto::{DeadLetterView, ListQuery, PurgeResponse, RequeueResponse};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/purge", post(purge))
        .route("/:id", get(get_entry).delete(delete_entry))
        .route("/:id/requeue", post(requeue))
}

fn parse_id(raw: &str) -> Result<DlqId, axum::response::Response> {
    DlqId::from_str(raw).map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("'{raw}' is not a dead-letter id"),
        )
    })
}

/// GET /dlq - List entries, oldest failure first
pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    match services.operator.list(&query.filter(), query.limit()).await {
        Ok(entries) => Json(
            entries
                .into_iter()
                .map(DeadLetterView::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => errors::operator_error_to_response(e),
    }
}

/// GET /dlq/:id
pub async fn get_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.operator.get(id).await {
        Ok(entry) => Json(DeadLetterView::from(entry)).into_response(),
        Err(e) => errors::operator_error_to_response(e),
    }
}

/// DELETE /dlq/:id - Discard an entry for good
pub async fn delete_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.operator.delete(id).await {
        Ok(entry) => Json(DeadLetterView::from(entry)).into_response(),
        Err(e) => errors::operator_error_to_response(e),
    }
}

/// POST /dlq/:id/requeue - Re-inject the payload as a new event
pub async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.operator.requeue(id).await {
        Ok(new_event_id) => (
            StatusCode::ACCEPTED,
            Json(RequeueResponse {
                dlq_id: id.to_string(),
                new_event_id: new_event_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => errors::operator_error_to_response(e),
    }
}

/// POST /dlq/purge - Remove every entry matching the JSON filter (`{}` for all)
pub async fn purge(
    Extension(services): Extension<Arc<AppServices>>,
    Json(filter): Json<DeadLetterFilter>,
) -> axum::response::Response {
    match services.operator.purge(&filter).await {
        Ok(removed) => Json(PurgeResponse { removed }).into_response(),
        Err(e) => errors::operator_error_to_response(e),
    }
}
