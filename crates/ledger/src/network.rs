//! Contract between the pipeline and a ledger network client.
//!
//! The pipeline never talks to peers or orderers itself. A `LedgerNetwork`
//! turns a connection profile plus a signing identity into a `Gateway`, and
//! the gateway submits or evaluates named transactions on a channel/contract
//! pair. Errors come back as raw `TransportError`s; classifying them is the
//! submission client's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use recordchain_core::{OrgId, TxId, ValidationCode};

use crate::wallet::WalletIdentity;

/// Connection profile of one organization (peers, orderers, CAs, TLS roots).
///
/// Opaque to the pipeline; parsed once at startup and handed to the network
/// client unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub org: OrgId,
    pub document: serde_json::Value,
}

impl ConnectionProfile {
    pub fn new(org: OrgId, document: serde_json::Value) -> Self {
        Self { org, document }
    }
}

/// Options applied when a gateway connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayOptions {
    /// Rewrite discovered peer addresses to `localhost` (local test networks).
    pub as_localhost: bool,
    pub endorse_timeout: Duration,
    pub commit_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            as_localhost: true,
            endorse_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(300),
            query_timeout: Duration::from_secs(3),
        }
    }
}

/// Which wait a timeout happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Endorse,
    Commit,
    Query,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Phase::Endorse => "endorsement",
            Phase::Commit => "commit",
            Phase::Query => "query",
        })
    }
}

/// Raw failure reported by a ledger network client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out waiting for {phase}: {message}")]
    Timeout { phase: Phase, message: String },

    /// Peers refused to endorse for reasons other than the chaincode's own
    /// answer (policy, mismatched read sets, ...).
    #[error("endorsement rejected: {message}")]
    EndorsementRejected { message: String },

    /// The transaction was ordered but peers marked it invalid.
    #[error("transaction {tx_id} was invalidated with code {code}")]
    CommitInvalid { tx_id: TxId, code: ValidationCode },

    /// The chaincode itself returned an error.
    #[error("chaincode error: {message}")]
    Chaincode { message: String },

    /// The transaction id was already submitted to the ledger.
    #[error("duplicate transaction id {tx_id}")]
    DuplicateTransaction { tx_id: TxId },

    #[error("no reachable peers or orderers: {message}")]
    NoPeers { message: String },

    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The gateway was closed (e.g. invalidated by the broker).
    #[error("gateway closed")]
    Closed,
}

/// A live connection to the ledger network, signing as one identity.
#[async_trait]
pub trait Gateway: Send + Sync + core::fmt::Debug {
    /// Endorse, order and wait for commit of `name(args)` under `tx_id`.
    async fn submit(
        &self,
        channel: &str,
        contract: &str,
        tx_id: &TxId,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>, TransportError>;

    /// Run `name(args)` on a single peer without ordering.
    async fn evaluate(
        &self,
        channel: &str,
        contract: &str,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>, TransportError>;

    /// Release the connection. Later calls fail with `TransportError::Closed`.
    async fn close(&self);
}

/// Factory for gateways.
#[async_trait]
pub trait LedgerNetwork: Send + Sync {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        identity: &WalletIdentity,
        options: &GatewayOptions,
    ) -> Result<Arc<dyn Gateway>, TransportError>;
}

/// A channel/contract pair resolved on a gateway.
#[derive(Debug, Clone)]
pub struct Contract {
    gateway: Arc<dyn Gateway>,
    channel: Arc<str>,
    name: Arc<str>,
}

impl Contract {
    pub fn new(gateway: Arc<dyn Gateway>, channel: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            gateway,
            channel: channel.into(),
            name: name.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn submit(&self, tx_id: &TxId, tx_name: &str, args: &[String]) -> Result<Vec<u8>, TransportError> {
        self.gateway
            .submit(&self.channel, &self.name, tx_id, tx_name, args)
            .await
    }

    pub async fn evaluate(&self, tx_name: &str, args: &[String]) -> Result<Vec<u8>, TransportError> {
        self.gateway
            .evaluate(&self.channel, &self.name, tx_name, args)
            .await
    }
}
