//! Commit confirmation through the read-only system contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use recordchain_core::{BusinessKind, ClassifiedError, ErrorClass, TxId, ValidationCode};

use crate::broker::NetworkHandle;
use crate::client::{SubmitError, business_kind, deadline};
use crate::network::{GatewayOptions, Phase, TransportError};
use crate::system::{ChainInfo, GET_CHAIN_INFO, GET_TRANSACTION_BY_ID, ProcessedTransaction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmError {
    #[error("transaction {0} not found")]
    NotFound(TxId),

    #[error("system query failed: {0}")]
    Query(SubmitError),

    #[error("undecodable system contract answer: {0}")]
    Decode(String),
}

/// Outcome of confirming an accepted submission.
///
/// `Unavailable` is a degraded success: the transaction was ordered, only
/// its validation outcome could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed {
        validation_code: ValidationCode,
        block_height: u64,
    },
    Unavailable {
        reason: String,
    },
}

impl Confirmation {
    /// The annotation recorded on a completed job whose confirmation failed.
    pub fn annotation(&self) -> Option<ClassifiedError> {
        match self {
            Confirmation::Confirmed { .. } => None,
            Confirmation::Unavailable { reason } => {
                Some(ClassifiedError::new(ErrorClass::ConfirmationUnavailable, reason.clone()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitConfirmer {
    query_deadline: Duration,
}

impl CommitConfirmer {
    pub fn new(options: &GatewayOptions) -> Self {
        Self {
            query_deadline: options.query_timeout,
        }
    }

    async fn query(&self, handle: &NetworkHandle, name: &str, args: &[String]) -> Result<Vec<u8>, TransportError> {
        let call = handle.system_contract().evaluate(name, args);
        deadline(self.query_deadline, Phase::Query, call).await
    }

    /// Validation code and block of a committed transaction.
    pub async fn transaction(&self, handle: &NetworkHandle, tx_id: &TxId) -> Result<ProcessedTransaction, ConfirmError> {
        let args = [handle.contract().channel().to_string(), tx_id.to_string()];
        let raw = match self.query(handle, GET_TRANSACTION_BY_ID, &args).await {
            Ok(raw) => raw,
            Err(TransportError::Chaincode { message })
                if business_kind(&message) == BusinessKind::NotFound =>
            {
                return Err(ConfirmError::NotFound(tx_id.clone()));
            }
            Err(err) => return Err(ConfirmError::Query(err.into())),
        };
        serde_json::from_slice(&raw).map_err(|e| ConfirmError::Decode(e.to_string()))
    }

    pub async fn validation_code(&self, handle: &NetworkHandle, tx_id: &TxId) -> Result<ValidationCode, ConfirmError> {
        Ok(self.transaction(handle, tx_id).await?.validation_code)
    }

    /// Current chain height of the handle's channel.
    pub async fn block_height(&self, handle: &NetworkHandle) -> Result<u64, ConfirmError> {
        let args = [handle.contract().channel().to_string()];
        let raw = self
            .query(handle, GET_CHAIN_INFO, &args)
            .await
            .map_err(|e| ConfirmError::Query(e.into()))?;
        let info: ChainInfo = serde_json::from_slice(&raw).map_err(|e| ConfirmError::Decode(e.to_string()))?;
        Ok(info.height)
    }

    /// Resolve the outcome of an accepted transaction. Never fails: lookup
    /// errors become [`Confirmation::Unavailable`].
    pub async fn confirm(&self, handle: &NetworkHandle, tx_id: &TxId) -> Confirmation {
        match self.transaction(handle, tx_id).await {
            Ok(tx) => {
                debug!(tx_id = %tx_id, code = %tx.validation_code, block = tx.block_number, "transaction confirmed");
                Confirmation::Confirmed {
                    validation_code: tx.validation_code,
                    block_height: tx.block_number,
                }
            }
            Err(err) => {
                warn!(tx_id = %tx_id, error = %err, "commit confirmation unavailable");
                Confirmation::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }
}
