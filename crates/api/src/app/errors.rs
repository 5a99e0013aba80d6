use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;

use recordchain_core::{BusinessKind, ErrorClass};
use recordchain_infra::jobs::PipelineError;
use recordchain_ledger::{BrokerError, ConfirmError, SubmitError};

/// `{status, timestamp}` body with the status's reason phrase.
pub fn json_status(status: StatusCode) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "status": reason_phrase(status),
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

/// `{status, reason, timestamp}` body; `reason` is a stable machine code.
pub fn json_reason(status: StatusCode, reason: &str) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "status": reason_phrase(status),
            "reason": reason,
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

pub fn json_error(status: StatusCode, reason: &str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "status": reason_phrase(status),
            "reason": reason,
            "message": message.into(),
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

fn submit_error_to_response(err: &SubmitError) -> axum::response::Response {
    let status = match err {
        SubmitError::Business {
            kind: BusinessKind::NotFound,
            ..
        } => StatusCode::NOT_FOUND,
        SubmitError::Business { .. } => StatusCode::BAD_REQUEST,
        SubmitError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SubmitError::Unavailable { .. } | SubmitError::Endorsement { .. } | SubmitError::Connection { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    json_error(status, err.class().as_str(), err.to_string())
}

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match &err {
        PipelineError::UnknownOrg(_) | PipelineError::InvalidRequest(_) => {
            json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
        }
        PipelineError::JobNotFound(_) => json_error(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", err.to_string()),
        PipelineError::Store(_) => {
            tracing::error!(error = %err, "job store error");
            json_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
        PipelineError::Broker(BrokerError::MissingIdentity(_)) => {
            json_reason(StatusCode::UNAUTHORIZED, "UNKNOWN_IDENTITY")
        }
        PipelineError::Broker(e) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::ConnectionError.as_str(),
            e.to_string(),
        ),
        PipelineError::Submit(e) => submit_error_to_response(e),
        PipelineError::Confirm(ConfirmError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "TRANSACTION_NOT_FOUND", err.to_string())
        }
        PipelineError::Confirm(ConfirmError::Query(e)) => submit_error_to_response(e),
        PipelineError::Confirm(ConfirmError::Decode(_)) => {
            tracing::error!(error = %err, "undecodable system contract response");
            json_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
