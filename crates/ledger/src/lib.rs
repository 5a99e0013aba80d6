//! Ledger network access: connection broker, submission client, commit confirmation.
//!
//! ## Components
//!
//! - `network`: the contract a ledger network client must satisfy (`LedgerNetwork`, `Gateway`)
//! - `wallet`: identity material keyed by label
//! - `broker`: one cached gateway per identity, built single-flight
//! - `client`: submit/evaluate with deadlines; the only place transport errors are classified
//! - `confirm`: validation-code and chain-height lookups through the system contract
//! - `memory`: an in-process ledger network for development and tests

pub mod broker;
pub mod client;
pub mod confirm;
pub mod memory;
pub mod network;
pub mod system;
pub mod wallet;

pub use broker::{BrokerConfig, BrokerError, NetworkBroker, NetworkHandle, OrgProfile};
pub use client::{SubmissionClient, SubmitError, Submitted};
pub use confirm::{CommitConfirmer, ConfirmError, Confirmation};
pub use memory::{Fault, InMemoryLedger};
pub use network::{Contract, ConnectionProfile, Gateway, GatewayOptions, LedgerNetwork, Phase, TransportError};
pub use wallet::{IdentityStore, InMemoryWallet, WalletError, WalletIdentity};
