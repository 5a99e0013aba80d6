//! Submission client: runs one ledger call over a network handle and
//! classifies whatever went wrong.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use recordchain_core::{BusinessKind, ClassifiedError, ErrorClass, TxId};

use crate::broker::NetworkHandle;
use crate::network::{GatewayOptions, Phase, TransportError};

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub tx_id: TxId,
    pub payload: Vec<u8>,
    /// The ledger already knew `tx_id`: an earlier attempt reached the
    /// orderer even though its caller saw a failure.
    pub duplicate: bool,
}

/// A classified submit or evaluate failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{message}")]
    Business { kind: BusinessKind, message: String },

    #[error("timed out waiting for {phase}: {message}")]
    Timeout { phase: Phase, message: String },

    #[error("{message}")]
    Unavailable { message: String },

    #[error("{message}")]
    Endorsement { message: String },

    #[error("{message}")]
    Connection { message: String },
}

impl SubmitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SubmitError::Business { .. } => ErrorClass::BusinessError,
            SubmitError::Timeout { .. } => ErrorClass::Timeout,
            SubmitError::Unavailable { .. } => ErrorClass::Unavailable,
            SubmitError::Endorsement { .. } => ErrorClass::EndorsementFailure,
            SubmitError::Connection { .. } => ErrorClass::ConnectionError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn to_classified(&self) -> ClassifiedError {
        match self {
            SubmitError::Business { kind, message } => ClassifiedError::business(*kind, message.clone()),
            other => ClassifiedError::new(other.class(), other.to_string()),
        }
    }

    /// Classify a raw transport failure. `DuplicateTransaction` is not an
    /// error for submit and is handled before this is reached.
    pub fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { phase, message } => SubmitError::Timeout { phase, message },
            TransportError::NoPeers { message } => SubmitError::Unavailable { message },
            TransportError::EndorsementRejected { message } => SubmitError::Endorsement { message },
            TransportError::CommitInvalid { tx_id, code } => SubmitError::Endorsement {
                message: format!("transaction {tx_id} failed validation with code {code}"),
            },
            TransportError::Chaincode { message } => {
                let message = chaincode_message(&message).to_string();
                SubmitError::Business {
                    kind: business_kind(&message),
                    message,
                }
            }
            TransportError::DuplicateTransaction { tx_id } => SubmitError::Business {
                kind: BusinessKind::AlreadyExists,
                message: format!("transaction {tx_id} was already submitted"),
            },
            err @ (TransportError::Connection { .. } | TransportError::Closed) => SubmitError::Connection {
                message: err.to_string(),
            },
        }
    }
}

impl From<TransportError> for SubmitError {
    fn from(err: TransportError) -> Self {
        Self::from_transport(err)
    }
}

/// The chaincode's own message, without the peer's wrapping.
///
/// `"... transaction returned with failure: Error: The asset A1 does not exist"`
/// becomes `"The asset A1 does not exist"`.
pub fn chaincode_message(raw: &str) -> &str {
    let tail = raw
        .rsplit_once("returned with failure:")
        .map_or(raw, |(_, tail)| tail)
        .trim();
    tail.strip_prefix("Error:").map_or(tail, str::trim)
}

pub fn business_kind(message: &str) -> BusinessKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("already exists") {
        BusinessKind::AlreadyExists
    } else if lower.contains("does not exist") || lower.contains("no such") || lower.contains("not found") {
        BusinessKind::NotFound
    } else {
        BusinessKind::Other
    }
}

/// Runs transactions against the target contract of a [`NetworkHandle`].
#[derive(Debug, Clone)]
pub struct SubmissionClient {
    submit_deadline: Duration,
    evaluate_deadline: Duration,
}

impl SubmissionClient {
    pub fn new(options: &GatewayOptions) -> Self {
        Self {
            submit_deadline: options.endorse_timeout + options.commit_timeout,
            evaluate_deadline: options.query_timeout,
        }
    }

    /// Submit under an explicit transaction id (reused across retries when
    /// the previous attempt's fate is unknown).
    pub async fn submit(
        &self,
        handle: &NetworkHandle,
        tx_id: &TxId,
        tx_name: &str,
        args: &[String],
    ) -> Result<Submitted, SubmitError> {
        debug!(identity = %handle.identity(), tx_id = %tx_id, tx_name, "submitting transaction");
        trace!(tx_id = %tx_id, ?args, "submit arguments");
        let call = handle.contract().submit(tx_id, tx_name, args);
        match deadline(self.submit_deadline, Phase::Commit, call).await {
            Ok(payload) => Ok(Submitted {
                tx_id: tx_id.clone(),
                payload,
                duplicate: false,
            }),
            Err(TransportError::DuplicateTransaction { .. }) => {
                warn!(tx_id = %tx_id, tx_name, "transaction id already on the ledger, treating as accepted");
                Ok(Submitted {
                    tx_id: tx_id.clone(),
                    payload: Vec::new(),
                    duplicate: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Submit under a freshly generated transaction id.
    pub async fn submit_new(
        &self,
        handle: &NetworkHandle,
        tx_name: &str,
        args: &[String],
    ) -> Result<Submitted, SubmitError> {
        self.submit(handle, &TxId::generate(), tx_name, args).await
    }

    /// Evaluate a read-only transaction on the target contract.
    pub async fn evaluate(&self, handle: &NetworkHandle, tx_name: &str, args: &[String]) -> Result<Vec<u8>, SubmitError> {
        debug!(identity = %handle.identity(), tx_name, "evaluating transaction");
        let call = handle.contract().evaluate(tx_name, args);
        let payload = deadline(self.evaluate_deadline, Phase::Query, call).await?;
        trace!(tx_name, payload = %String::from_utf8_lossy(&payload), "evaluate result");
        Ok(payload)
    }
}

pub(crate) async fn deadline<T>(
    limit: Duration,
    phase: Phase,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TransportError::Timeout {
            phase,
            message: format!("no answer within {}ms", limit.as_millis()),
        })?
}
