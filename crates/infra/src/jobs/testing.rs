//! Test fixtures: a pipeline wired to an in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use recordchain_core::{CredentialId, IdentityRef, OrgId};
use recordchain_ledger::{
    BrokerConfig, ConnectionProfile, GatewayOptions, IdentityStore, InMemoryLedger, InMemoryWallet, NetworkBroker,
    OrgProfile, WalletIdentity,
};

use super::pipeline::SubmitPipeline;
use super::queue::InMemoryJobQueue;
use super::store::{InMemoryJobStore, Retention};
use super::types::RetryPolicy;

pub(crate) const ORGS: [&str; 2] = ["Org1", "Org2"];

pub(crate) fn org(name: &str) -> OrgId {
    OrgId::new(name).unwrap()
}

pub(crate) fn org1() -> IdentityRef {
    IdentityRef::org(org("Org1"))
}

pub(crate) fn alice() -> IdentityRef {
    IdentityRef::user(org("Org2"), CredentialId::new("alice@example.com").unwrap())
}

pub(crate) fn options() -> GatewayOptions {
    GatewayOptions {
        as_localhost: true,
        endorse_timeout: Duration::from_millis(500),
        commit_timeout: Duration::from_millis(500),
        query_timeout: Duration::from_millis(200),
    }
}

pub(crate) struct Harness {
    pub ledger: InMemoryLedger,
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub pipeline: SubmitPipeline,
}

impl Harness {
    pub async fn new(retry: RetryPolicy) -> Self {
        Self::with_retention(retry, Retention::default()).await
    }

    pub async fn with_retention(retry: RetryPolicy, retention: Retention) -> Self {
        let ledger = InMemoryLedger::new();

        let wallet = InMemoryWallet::new();
        for name in ORGS {
            let msp = format!("{name}MSP");
            wallet.put(WalletIdentity::x509(&msp, &msp, "cert", "key")).await.unwrap();
        }
        wallet
            .put(WalletIdentity::x509("alice@example.com", "Org2MSP", "cert", "key"))
            .await
            .unwrap();

        let orgs = ORGS.map(|name| OrgProfile {
            profile: ConnectionProfile::new(org(name), serde_json::json!({ "name": name })),
            msp_id: format!("{name}MSP"),
        });
        let broker = NetworkBroker::new(
            Arc::new(ledger.clone()),
            Arc::new(wallet),
            orgs,
            BrokerConfig {
                channel: "property-channel".to_string(),
                chaincode: "property-cc".to_string(),
                options: options(),
            },
        );

        let store = Arc::new(InMemoryJobStore::new(retention));
        let queue = Arc::new(InMemoryJobQueue::new());
        let pipeline = SubmitPipeline::new(store.clone(), queue.clone(), Arc::new(broker), &options(), retry);

        Self {
            ledger,
            store,
            queue,
            pipeline,
        }
    }
}

/// `CreateAsset` arguments for a property record.
pub(crate) fn create_asset(id: &str) -> Vec<String> {
    vec![
        id.to_string(),
        serde_json::json!({ "Owner": "Tom", "AppraisedValue": 1300 }).to_string(),
    ]
}
