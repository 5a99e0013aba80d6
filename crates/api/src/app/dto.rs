use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use recordchain_core::{JobId, TxId, ValidationCode};

use crate::app::errors;

/// Body of `POST /api/jobs` and `POST /api/evaluate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub transaction_name: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

impl TransactionRequest {
    /// Chaincode arguments are strings; other JSON values are passed as their JSON text.
    pub fn string_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), axum::response::Response> {
        if self.transaction_name.trim().is_empty() {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                "transactionName is required",
            ));
        }
        Ok(())
    }
}

pub fn job_accepted(job_id: JobId) -> JsonValue {
    json!({
        "status": StatusCode::ACCEPTED.canonical_reason(),
        "jobId": job_id,
        "timestamp": Utc::now(),
    })
}

pub fn transaction_status(tx_id: &TxId, code: &ValidationCode) -> JsonValue {
    json!({
        "transactionId": tx_id,
        "validationCode": code,
    })
}

/// Chaincode payloads are JSON when the contract returns documents; anything
/// else is returned as a string.
pub fn payload_to_json(payload: &[u8]) -> JsonValue {
    if payload.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(payload).into_owned()))
}
