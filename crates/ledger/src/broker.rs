//! Network broker: one gateway per identity, built once and shared.
//!
//! The broker is an explicit registry rather than ambient global state:
//! it is created at startup with every organization's connection profile,
//! hands out `Arc<NetworkHandle>`s on demand, rebuilds a handle after a hard
//! connection fault (`invalidate`) and closes everything on `shutdown`.
//!
//! Construction is single-flight per identity: concurrent callers asking for
//! the same uncached identity all await the one in-flight connect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use recordchain_core::{ErrorClass, IdentityRef, OrgId};

use crate::network::{ConnectionProfile, Contract, Gateway, GatewayOptions, LedgerNetwork, TransportError};
use crate::system::SYSTEM_CONTRACT;
use crate::wallet::{IdentityStore, WalletError};

/// Static description of one member organization.
#[derive(Debug, Clone)]
pub struct OrgProfile {
    pub profile: ConnectionProfile,
    /// MSP id; also the wallet label of the organization's own identity.
    pub msp_id: String,
}

impl OrgProfile {
    pub fn org(&self) -> &OrgId {
        &self.profile.org
    }
}

/// Which channel and contract handles are bound to.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub channel: String,
    pub chaincode: String,
    pub options: GatewayOptions,
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("unknown organization: {0}")]
    UnknownOrg(OrgId),

    #[error("no identity in wallet for {0}")]
    MissingIdentity(String),

    #[error("identity {label} belongs to {actual}, not {expected}")]
    IdentityMismatch {
        label: String,
        expected: String,
        actual: String,
    },

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("failed to connect as {identity}: {source}")]
    Connect {
        identity: IdentityRef,
        source: TransportError,
    },

    #[error("network broker is shut down")]
    ShutDown,
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ConnectionError
    }
}

/// A cached connection bound to one identity, with the target contract and
/// the system contract resolved on it.
#[derive(Debug)]
pub struct NetworkHandle {
    identity: IdentityRef,
    generation: u64,
    gateway: Arc<dyn Gateway>,
    contract: Contract,
    system: Contract,
}

impl NetworkHandle {
    fn new(identity: IdentityRef, generation: u64, gateway: Arc<dyn Gateway>, config: &BrokerConfig) -> Self {
        let contract = Contract::new(gateway.clone(), config.channel.as_str(), config.chaincode.as_str());
        let system = Contract::new(gateway.clone(), config.channel.as_str(), SYSTEM_CONTRACT);
        Self {
            identity,
            generation,
            gateway,
            contract,
            system,
        }
    }

    pub fn identity(&self) -> &IdentityRef {
        &self.identity
    }

    /// Distinguishes a rebuilt handle from the one it replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The target chaincode.
    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// The read-only system contract.
    pub fn system_contract(&self) -> &Contract {
        &self.system
    }

    async fn close(&self) {
        self.gateway.close().await;
    }
}

type Slot = Arc<OnceCell<Arc<NetworkHandle>>>;

/// Owns every gateway in the process.
pub struct NetworkBroker {
    network: Arc<dyn LedgerNetwork>,
    wallet: Arc<dyn IdentityStore>,
    orgs: HashMap<OrgId, OrgProfile>,
    config: BrokerConfig,
    slots: Mutex<HashMap<IdentityRef, Slot>>,
    generations: AtomicU64,
    shut_down: AtomicBool,
}

impl core::fmt::Debug for NetworkBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkBroker")
            .field("orgs", &self.org_ids())
            .field("config", &self.config)
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

impl NetworkBroker {
    pub fn new(
        network: Arc<dyn LedgerNetwork>,
        wallet: Arc<dyn IdentityStore>,
        orgs: impl IntoIterator<Item = OrgProfile>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            network,
            wallet,
            orgs: orgs.into_iter().map(|o| (o.org().clone(), o)).collect(),
            config,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Configured organizations, sorted by name.
    pub fn org_ids(&self) -> Vec<OrgId> {
        let mut ids: Vec<OrgId> = self.orgs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn knows_org(&self, org: &OrgId) -> bool {
        self.orgs.contains_key(org)
    }

    /// Number of identities with a connected handle.
    pub fn cached(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<IdentityRef, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the handle for `identity`, connecting on first use.
    pub async fn get_handle(&self, identity: &IdentityRef) -> Result<Arc<NetworkHandle>, BrokerError> {
        let slot = {
            let mut slots = self.slots();
            if self.shut_down.load(Ordering::Acquire) {
                return Err(BrokerError::ShutDown);
            }
            slots
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let handle = slot.get_or_try_init(|| self.build(identity)).await?.clone();

        // A shutdown that drained the slot while it was connecting never saw
        // this handle.
        let shut_down = {
            let _slots = self.slots();
            self.shut_down.load(Ordering::Acquire)
        };
        if shut_down {
            handle.close().await;
            return Err(BrokerError::ShutDown);
        }
        Ok(handle)
    }

    /// Eagerly connect every organization's own identity (startup).
    pub async fn connect_all(&self) -> Result<(), BrokerError> {
        for org in self.org_ids() {
            info!(org = %org, "connecting to ledger network");
            self.get_handle(&IdentityRef::org(org)).await?;
        }
        Ok(())
    }

    /// Drop `handle` from the cache and close it.
    ///
    /// Only the cached handle of the same generation is removed, so a late
    /// invalidation never evicts a handle that was already rebuilt.
    pub async fn invalidate(&self, handle: &NetworkHandle) {
        let removed = {
            let mut slots = self.slots();
            let current = slots
                .get(handle.identity())
                .and_then(|slot| slot.get())
                .map(|h| h.generation());
            if current == Some(handle.generation()) {
                slots.remove(handle.identity())
            } else {
                None
            }
        };

        if removed.is_some() {
            warn!(
                identity = %handle.identity(),
                generation = handle.generation(),
                "invalidated network handle"
            );
        }
        handle.close().await;
    }

    /// Close every handle; later `get_handle` calls fail with `ShutDown`.
    pub async fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots();
            self.shut_down.store(true, Ordering::Release);
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            if let Some(handle) = slot.get() {
                debug!(identity = %handle.identity(), "closing gateway");
                handle.close().await;
            }
        }
        info!("network broker shut down");
    }

    async fn build(&self, identity: &IdentityRef) -> Result<Arc<NetworkHandle>, BrokerError> {
        let org = self
            .orgs
            .get(identity.org_id())
            .ok_or_else(|| BrokerError::UnknownOrg(identity.org_id().clone()))?;

        let label = match identity {
            IdentityRef::WellKnownOrg { .. } => org.msp_id.as_str(),
            IdentityRef::AdHocUser { credential, .. } => credential.as_str(),
        };
        let signer = self
            .wallet
            .get(label)
            .await?
            .ok_or_else(|| BrokerError::MissingIdentity(label.to_string()))?;
        if signer.msp_id != org.msp_id {
            return Err(BrokerError::IdentityMismatch {
                label: label.to_string(),
                expected: org.msp_id.clone(),
                actual: signer.msp_id,
            });
        }

        debug!(identity = %identity, "configuring gateway");
        let gateway = self
            .network
            .connect(&org.profile, &signer, &self.config.options)
            .await
            .map_err(|source| BrokerError::Connect {
                identity: identity.clone(),
                source,
            })?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(identity = %identity, generation, "gateway connected");
        Ok(Arc::new(NetworkHandle::new(
            identity.clone(),
            generation,
            gateway,
            &self.config,
        )))
    }
}
