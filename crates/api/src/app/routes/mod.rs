use axum::{routing::get, Router};

pub mod dlq;
pub mod retries;
pub mod system;

/// Router for every operator (token-protected) endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/queue", get(system::queue))
        .route("/retries/:event_id", get(retries::retry_status))
        .nest("/dlq", dlq::router())
}
