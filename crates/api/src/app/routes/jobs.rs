use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use recordchain_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::CallerContext;

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Json(body): Json<dto::TransactionRequest>,
) -> axum::response::Response {
    if let Err(resp) = body.validate() {
        return resp;
    }

    match services
        .pipeline
        .enqueue(caller.identity().clone(), &body.transaction_name, body.string_args())
        .await
    {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(dto::job_accepted(job_id))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.pipeline.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = job_id.parse::<JobId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", format!("job not found: {job_id}"));
    };

    match services.pipeline.get_job(job_id).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
