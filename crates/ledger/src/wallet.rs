//! Identity wallet: signing material keyed by label.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// X.509 signing identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletIdentity {
    /// Wallet label (an org's MSP id, or a user's credential id).
    pub label: String,
    pub msp_id: String,
    pub certificate: String,
    pub private_key: String,
}

impl WalletIdentity {
    pub fn x509(
        label: impl Into<String>,
        msp_id: impl Into<String>,
        certificate: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            msp_id: msp_id.into(),
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }
}

impl core::fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WalletIdentity")
            .field("label", &self.label)
            .field("msp_id", &self.msp_id)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("wallet storage error: {0}")]
    Storage(String),
}

/// Wallet abstraction.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, label: &str) -> Result<Option<WalletIdentity>, WalletError>;

    /// Store a new identity; existing labels are never overwritten.
    async fn put(&self, identity: WalletIdentity) -> Result<(), WalletError>;
}

/// In-memory wallet for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWallet {
    identities: RwLock<HashMap<String, WalletIdentity>>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> WalletError {
        WalletError::Storage("wallet lock poisoned".to_string())
    }
}

#[async_trait]
impl IdentityStore for InMemoryWallet {
    async fn get(&self, label: &str) -> Result<Option<WalletIdentity>, WalletError> {
        let identities = self.identities.read().map_err(|_| Self::poisoned())?;
        Ok(identities.get(label).cloned())
    }

    async fn put(&self, identity: WalletIdentity) -> Result<(), WalletError> {
        let mut identities = self.identities.write().map_err(|_| Self::poisoned())?;
        if identities.contains_key(&identity.label) {
            return Err(WalletError::AlreadyExists(identity.label));
        }
        identities.insert(identity.label.clone(), identity);
        Ok(())
    }
}
