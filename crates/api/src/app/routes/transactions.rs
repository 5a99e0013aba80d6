use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use recordchain_core::TxId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::CallerContext;

/// Read-only call; never goes through the job queue.
pub async fn evaluate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Json(body): Json<dto::TransactionRequest>,
) -> axum::response::Response {
    if let Err(resp) = body.validate() {
        return resp;
    }

    match services
        .pipeline
        .evaluate(caller.identity(), &body.transaction_name, &body.string_args())
        .await
    {
        Ok(payload) => (StatusCode::OK, Json(dto::payload_to_json(&payload))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn transaction_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Path(tx_id): Path<String>,
) -> axum::response::Response {
    let tx_id = match tx_id.parse::<TxId>() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()),
    };

    match services.pipeline.transaction_status(caller.identity(), &tx_id).await {
        Ok(code) => (StatusCode::OK, Json(dto::transaction_status(&tx_id, &code))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
