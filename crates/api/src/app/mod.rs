//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: background services (broker, job store/queue, workers, scheduler)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth_state = middleware::AuthState {
        api_keys: Arc::new(services.api_keys.clone()),
    };

    // Protected routes: require a valid API key.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::api_key_middleware,
    ));

    Router::new()
        .route("/ready", get(routes::system::ready))
        .route("/live", get(routes::system::live))
        .nest("/api", protected)
        .fallback(routes::system::not_found)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
