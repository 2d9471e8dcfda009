use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conduit_infra::dlq::OperatorError;
use conduit_infra::retry::LedgerError;
use conduit_stream::TransportError;

pub fn operator_error_to_response(err: OperatorError) -> axum::response::Response {
    match err {
        OperatorError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead-letter entry {id} not found"),
        ),
        OperatorError::Store(e) => {
            tracing::error!(error = %e, "dead-letter store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        OperatorError::Publish(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable", err.to_string())
}

pub fn transport_error_to_response(err: TransportError) -> axum::response::Response {
    json_error(StatusCode::BAD_GATEWAY, "queue_unavailable", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
