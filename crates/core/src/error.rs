//! Domain error model and the submission failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, malformed ids).
/// Ledger and transport failures are expressed with [`ErrorClass`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state transition that the job state machine forbids.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}

/// Classification of a failed ledger interaction.
///
/// Assigned once, where transport errors are translated; everything upstream
/// reacts to the class only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// The chaincode rejected the request (caller-correctable).
    BusinessError,
    /// Endorsement or commit wait exceeded its deadline.
    Timeout,
    /// No reachable peer or orderer.
    Unavailable,
    /// Peers rejected the proposal (conflicting reads, policy).
    EndorsementFailure,
    /// The broker could not provide a network handle.
    ConnectionError,
    /// Submitted and accepted, but the validation outcome could not be read.
    ConfirmationUnavailable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::BusinessError => "BUSINESS_ERROR",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::Unavailable => "UNAVAILABLE",
            ErrorClass::EndorsementFailure => "ENDORSEMENT_FAILURE",
            ErrorClass::ConnectionError => "CONNECTION_ERROR",
            ErrorClass::ConfirmationUnavailable => "CONFIRMATION_UNAVAILABLE",
        }
    }

    /// Whether a submit that failed with this class may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::Unavailable
                | ErrorClass::EndorsementFailure
                | ErrorClass::ConnectionError
        )
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refinement of [`ErrorClass::BusinessError`] derived from the chaincode message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessKind {
    AlreadyExists,
    NotFound,
    Other,
}

/// A failure reduced to its class plus a human-readable message.
///
/// This is what gets recorded on a job and shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_kind: Option<BusinessKind>,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            business_kind: None,
            message: message.into(),
        }
    }

    pub fn business(kind: BusinessKind, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::BusinessError,
            business_kind: Some(kind),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}
