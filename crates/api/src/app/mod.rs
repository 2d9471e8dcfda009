//! Router assembly.

use std::sync::Arc;

use axum::{extract::Extension, routing::get, Router};
use tower::ServiceBuilder;

use crate::middleware::{AuthState, auth_middleware};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, Runtime, build_runtime};

/// Public `/health` and `/metrics`, everything else behind the admin token.
pub fn build_app(services: AppServices, admin_token: String) -> Router {
    let services = Arc::new(services);

    let protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                AuthState::new(admin_token),
                auth_middleware,
            ))
            .layer(Extension(services)),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .merge(protected)
}
