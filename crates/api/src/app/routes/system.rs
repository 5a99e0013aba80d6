use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse};
use tracing::warn;

use crate::app::errors::json_status;
use crate::app::services::AppServices;

pub async fn ready() -> axum::response::Response {
    json_status(StatusCode::OK)
}

/// Healthy when every organization can read the chain height.
pub async fn live(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let mut healthy = true;
    for (org, height) in services.pipeline.block_heights().await {
        if let Err(e) = height {
            warn!(org = %org, error = %e, "liveness check failed");
            healthy = false;
        }
    }

    if healthy {
        json_status(StatusCode::OK)
    } else {
        json_status(StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub async fn not_found() -> impl IntoResponse {
    json_status(StatusCode::NOT_FOUND)
}
