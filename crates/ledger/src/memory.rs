//! In-process ledger network for development and tests.
//!
//! Keeps a single world state shared by every gateway, commits one
//! transaction per block, and answers the system contract queries. Failures
//! can be scripted per transaction name with [`Fault`]s so retry and
//! classification paths can be driven deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::trace;

use recordchain_core::{TxId, ValidationCode};

use crate::network::{ConnectionProfile, Gateway, GatewayOptions, LedgerNetwork, Phase, TransportError};
use crate::system::{ChainInfo, GET_CHAIN_INFO, GET_TRANSACTION_BY_ID, ProcessedTransaction, SYSTEM_CONTRACT};
use crate::wallet::WalletIdentity;

/// A scripted failure, consumed by the next call of the named transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a deadline error in the given phase; nothing is committed.
    Timeout(Phase),
    /// No peers reachable; nothing is committed.
    Unavailable,
    /// Endorsement policy not satisfied; nothing is committed.
    EndorsementRejected,
    /// Ordered, then invalidated with `MVCC_READ_CONFLICT`.
    MvccConflict,
    /// The chaincode answers with this error message.
    Chaincode(String),
    /// The gateway loses its connection mid-call.
    ConnectionLost,
    /// Commit succeeds but the caller only sees a commit timeout.
    CommitThenTimeout,
    /// Ordered and invalidated with `MVCC_READ_CONFLICT`, but the caller
    /// only sees a commit timeout.
    InvalidThenTimeout,
    /// Wait, then proceed normally.
    Delay(Duration),
}

#[derive(Debug)]
struct LedgerState {
    world: Mutex<BTreeMap<String, JsonValue>>,
    transactions: Mutex<HashMap<TxId, ProcessedTransaction>>,
    height: AtomicU64,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    system_unavailable: AtomicBool,
    refuse_connections: AtomicBool,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
    open: AtomicUsize,
    submits: AtomicUsize,
}

/// Shared in-memory network; cloning yields another handle to the same ledger.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    state: Arc<LedgerState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LedgerState {
                world: Mutex::new(BTreeMap::new()),
                transactions: Mutex::new(HashMap::new()),
                // genesis block
                height: AtomicU64::new(1),
                faults: Mutex::new(HashMap::new()),
                system_unavailable: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
                connect_delay: Mutex::new(Duration::ZERO),
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue faults for upcoming calls of `tx_name` (in order).
    pub fn inject(&self, tx_name: &str, faults: impl IntoIterator<Item = Fault>) {
        lock(&self.state.faults)
            .entry(tx_name.to_string())
            .or_default()
            .extend(faults);
    }

    /// Make every system contract query time out.
    pub fn set_system_unavailable(&self, unavailable: bool) {
        self.state.system_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Delay applied to every `connect` (widens single-flight windows in tests).
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    /// Number of gateways successfully created.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Gateways created and not yet closed.
    pub fn open_gateways(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Number of submit calls received (including failed ones).
    pub fn submit_count(&self) -> usize {
        self.state.submits.load(Ordering::SeqCst)
    }

    pub fn height(&self) -> u64 {
        self.state.height.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        lock(&self.state.world).get(key).cloned()
    }

    pub fn transaction(&self, tx_id: &TxId) -> Option<ProcessedTransaction> {
        lock(&self.state.transactions).get(tx_id).cloned()
    }

    /// Number of transactions committed under `tx_id` that ended `VALID`.
    pub fn committed_valid(&self) -> usize {
        lock(&self.state.transactions)
            .values()
            .filter(|t| t.validation_code.is_valid())
            .count()
    }

    fn next_fault(&self, tx_name: &str) -> Option<Fault> {
        lock(&self.state.faults)
            .get_mut(tx_name)
            .and_then(VecDeque::pop_front)
    }

    fn record(&self, tx_id: &TxId, code: ValidationCode) -> u64 {
        let block_number = self.state.height.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.transactions).insert(
            tx_id.clone(),
            ProcessedTransaction {
                validation_code: code,
                block_number,
            },
        );
        block_number
    }

    fn commit(&self, tx_id: &TxId, name: &str, args: &[String]) -> Result<Vec<u8>, TransportError> {
        if lock(&self.state.transactions).contains_key(tx_id) {
            return Err(TransportError::DuplicateTransaction { tx_id: tx_id.clone() });
        }
        let payload = {
            let mut world = lock(&self.state.world);
            run_chaincode(&mut world, name, args)
                .map_err(|message| TransportError::Chaincode { message })?
        };
        let block = self.record(tx_id, ValidationCode::valid());
        trace!(tx_id = %tx_id, block, "committed transaction");
        Ok(payload)
    }

    fn query_system(&self, name: &str, args: &[String]) -> Result<Vec<u8>, TransportError> {
        if self.state.system_unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout {
                phase: Phase::Query,
                message: "system contract did not answer".to_string(),
            });
        }
        let encoded = match name {
            GET_TRANSACTION_BY_ID => {
                let tx_id: TxId = arg(args, 1, name)?
                    .parse()
                    .map_err(|e| TransportError::Chaincode { message: format!("{e}") })?;
                let tx = self.transaction(&tx_id).ok_or_else(|| TransportError::Chaincode {
                    message: format!("Failed to get transaction with id {tx_id}, error no such transaction ID [{tx_id}] in index"),
                })?;
                serde_json::to_vec(&tx)
            }
            GET_CHAIN_INFO => serde_json::to_vec(&ChainInfo { height: self.height() }),
            other => {
                return Err(TransportError::Chaincode {
                    message: format!("function {other} is not defined in {SYSTEM_CONTRACT}"),
                });
            }
        };
        encoded.map_err(|e| TransportError::Chaincode { message: e.to_string() })
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerNetwork for InMemoryLedger {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        identity: &WalletIdentity,
        _options: &GatewayOptions,
    ) -> Result<Arc<dyn Gateway>, TransportError> {
        let delay = *lock(&self.state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connection {
                message: format!("peers of {} refused the connection", profile.org),
            });
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryGateway {
            ledger: self.clone(),
            label: identity.label.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Gateway onto an [`InMemoryLedger`].
#[derive(Debug)]
pub struct InMemoryGateway {
    ledger: InMemoryLedger,
    label: String,
    closed: AtomicBool,
}

impl InMemoryGateway {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Apply a scripted fault. `Ok(true)` means "commit, then report a commit timeout".
    async fn apply_fault(&self, tx_id: Option<&TxId>, name: &str) -> Result<bool, TransportError> {
        let Some(fault) = self.ledger.next_fault(name) else {
            return Ok(false);
        };
        trace!(identity = %self.label, tx_name = name, ?fault, "injecting fault");
        match fault {
            Fault::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(false)
            }
            Fault::CommitThenTimeout => Ok(tx_id.is_some()),
            Fault::Timeout(phase) => Err(TransportError::Timeout {
                phase,
                message: format!("{name} did not complete in time"),
            }),
            Fault::Unavailable => Err(TransportError::NoPeers {
                message: "no endorsing peers reachable".to_string(),
            }),
            Fault::EndorsementRejected => Err(TransportError::EndorsementRejected {
                message: "ENDORSEMENT_POLICY_FAILURE".to_string(),
            }),
            Fault::MvccConflict => match tx_id {
                Some(tx_id) => {
                    self.ledger.record(tx_id, ValidationCode::new("MVCC_READ_CONFLICT"));
                    Err(TransportError::CommitInvalid {
                        tx_id: tx_id.clone(),
                        code: ValidationCode::new("MVCC_READ_CONFLICT"),
                    })
                }
                None => Ok(false),
            },
            Fault::InvalidThenTimeout => match tx_id {
                Some(tx_id) => {
                    self.ledger.record(tx_id, ValidationCode::new("MVCC_READ_CONFLICT"));
                    Err(TransportError::Timeout {
                        phase: Phase::Commit,
                        message: format!("no commit event received for {tx_id}"),
                    })
                }
                None => Ok(false),
            },
            Fault::Chaincode(message) => Err(TransportError::Chaincode { message }),
            Fault::ConnectionLost => Err(TransportError::Connection {
                message: "connection reset by peer".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn submit(
        &self,
        _channel: &str,
        contract: &str,
        tx_id: &TxId,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        self.ledger.state.submits.fetch_add(1, Ordering::SeqCst);
        if contract == SYSTEM_CONTRACT {
            return Err(TransportError::Chaincode {
                message: format!("{SYSTEM_CONTRACT} does not accept transactions"),
            });
        }

        let commit_then_timeout = self.apply_fault(Some(tx_id), name).await?;
        let payload = self.ledger.commit(tx_id, name, args)?;
        if commit_then_timeout {
            return Err(TransportError::Timeout {
                phase: Phase::Commit,
                message: format!("no commit event received for {tx_id}"),
            });
        }
        Ok(payload)
    }

    async fn evaluate(
        &self,
        _channel: &str,
        contract: &str,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        if contract == SYSTEM_CONTRACT {
            return self.ledger.query_system(name, args);
        }
        self.apply_fault(None, name).await?;
        // Evaluation never touches the shared state.
        let mut scratch = lock(&self.ledger.state.world).clone();
        run_chaincode(&mut scratch, name, args).map_err(|message| TransportError::Chaincode { message })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ledger.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str, TransportError> {
    args.get(index).map(String::as_str).ok_or_else(|| TransportError::Chaincode {
        message: format!("{name} expects at least {} arguments, got {}", index + 1, args.len()),
    })
}

fn expect_args(args: &[String], n: usize, name: &str) -> Result<(), String> {
    if args.len() != n {
        return Err(format!("{name} expects {n} arguments, got {}", args.len()));
    }
    Ok(())
}

fn parse_document(id: &str, raw: &str) -> Result<JsonValue, String> {
    let mut doc: JsonValue =
        serde_json::from_str(raw).map_err(|e| format!("invalid asset document for {id}: {e}"))?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| format!("asset document for {id} must be a JSON object"))?;
    obj.insert("ID".to_string(), JsonValue::String(id.to_string()));
    Ok(doc)
}

/// Key/value asset contract. Documents are stored as JSON objects whose keys
/// serialize in sorted order, so every peer produces identical bytes.
fn run_chaincode(
    world: &mut BTreeMap<String, JsonValue>,
    name: &str,
    args: &[String],
) -> Result<Vec<u8>, String> {
    let missing = |id: &str| format!("The asset {id} does not exist");
    match name {
        "CreateAsset" => {
            expect_args(args, 2, name)?;
            let id = &args[0];
            if world.contains_key(id) {
                return Err(format!("The asset {id} already exists"));
            }
            world.insert(id.clone(), parse_document(id, &args[1])?);
            Ok(Vec::new())
        }
        "ReadAsset" => {
            expect_args(args, 1, name)?;
            let doc = world.get(&args[0]).ok_or_else(|| missing(&args[0]))?;
            serde_json::to_vec(doc).map_err(|e| e.to_string())
        }
        "UpdateAsset" => {
            expect_args(args, 2, name)?;
            let id = &args[0];
            if !world.contains_key(id) {
                return Err(missing(id));
            }
            world.insert(id.clone(), parse_document(id, &args[1])?);
            Ok(Vec::new())
        }
        "DeleteAsset" => {
            expect_args(args, 1, name)?;
            world.remove(&args[0]).ok_or_else(|| missing(&args[0]))?;
            Ok(Vec::new())
        }
        "AssetExists" => {
            expect_args(args, 1, name)?;
            Ok(world.contains_key(&args[0]).to_string().into_bytes())
        }
        "TransferAsset" => {
            expect_args(args, 2, name)?;
            let doc = world.get_mut(&args[0]).ok_or_else(|| missing(&args[0]))?;
            let old_owner = doc.get("Owner").cloned().unwrap_or(JsonValue::Null);
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("Owner".to_string(), JsonValue::String(args[1].clone()));
            }
            serde_json::to_vec(&serde_json::json!({ "oldOwner": old_owner })).map_err(|e| e.to_string())
        }
        "GetAllAssets" => {
            expect_args(args, 0, name)?;
            let all: Vec<&JsonValue> = world.values().collect();
            serde_json::to_vec(&all).map_err(|e| e.to_string())
        }
        other => Err(format!("function {other} is not defined in the contract")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordchain_core::OrgId;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new(OrgId::new("Org1").unwrap(), serde_json::json!({}))
    }

    fn identity() -> WalletIdentity {
        WalletIdentity::x509("Org1MSP", "Org1MSP", "cert", "key")
    }

    async fn gateway(ledger: &InMemoryLedger) -> Arc<dyn Gateway> {
        ledger
            .connect(&profile(), &identity(), &GatewayOptions::default())
            .await
            .unwrap()
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn commit_records_transaction_and_grows_chain() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;
        let tx = TxId::generate();

        gw.submit("ch", "cc", &tx, "CreateAsset", &args(&["A1", r#"{"Owner":"Tom"}"#]))
            .await
            .unwrap();

        assert_eq!(ledger.height(), 2);
        let processed = ledger.transaction(&tx).unwrap();
        assert!(processed.validation_code.is_valid());
        assert_eq!(processed.block_number, 1);
        assert_eq!(ledger.get("A1").unwrap()["Owner"], "Tom");
    }

    #[tokio::test]
    async fn duplicate_tx_id_is_rejected() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;
        let tx = TxId::generate();
        let create = args(&["A1", "{}"]);

        gw.submit("ch", "cc", &tx, "CreateAsset", &create).await.unwrap();
        let err = gw.submit("ch", "cc", &tx, "CreateAsset", &create).await.unwrap_err();
        assert_eq!(err, TransportError::DuplicateTransaction { tx_id: tx });
    }

    #[tokio::test]
    async fn chaincode_errors_do_not_commit() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;

        let err = gw
            .submit("ch", "cc", &TxId::generate(), "DeleteAsset", &args(&["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Chaincode { message } if message == "The asset nope does not exist"));
        assert_eq!(ledger.height(), 1);
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let ledger = InMemoryLedger::new();
        ledger.inject("CreateAsset", [Fault::Unavailable, Fault::Timeout(Phase::Endorse)]);
        let gw = gateway(&ledger).await;
        let create = args(&["A1", "{}"]);

        let first = gw.submit("ch", "cc", &TxId::generate(), "CreateAsset", &create).await;
        assert!(matches!(first, Err(TransportError::NoPeers { .. })));
        let second = gw.submit("ch", "cc", &TxId::generate(), "CreateAsset", &create).await;
        assert!(matches!(second, Err(TransportError::Timeout { phase: Phase::Endorse, .. })));
        let third = gw.submit("ch", "cc", &TxId::generate(), "CreateAsset", &create).await;
        assert!(third.is_ok());
        assert_eq!(ledger.submit_count(), 3);
    }

    #[tokio::test]
    async fn commit_then_timeout_leaves_a_committed_transaction() {
        let ledger = InMemoryLedger::new();
        ledger.inject("CreateAsset", [Fault::CommitThenTimeout]);
        let gw = gateway(&ledger).await;
        let tx = TxId::generate();

        let err = gw
            .submit("ch", "cc", &tx, "CreateAsset", &args(&["A1", "{}"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { phase: Phase::Commit, .. }));
        assert!(ledger.transaction(&tx).unwrap().validation_code.is_valid());
    }

    #[tokio::test]
    async fn invalid_then_timeout_records_an_invalid_transaction() {
        let ledger = InMemoryLedger::new();
        ledger.inject("CreateAsset", [Fault::InvalidThenTimeout]);
        let gw = gateway(&ledger).await;
        let tx = TxId::generate();
        let create = args(&["A1", "{}"]);

        let err = gw.submit("ch", "cc", &tx, "CreateAsset", &create).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { phase: Phase::Commit, .. }));
        assert_eq!(ledger.transaction(&tx).unwrap().validation_code.as_str(), "MVCC_READ_CONFLICT");
        assert!(ledger.get("A1").is_none());

        let again = gw.submit("ch", "cc", &tx, "CreateAsset", &create).await.unwrap_err();
        assert!(matches!(again, TransportError::DuplicateTransaction { .. }));
    }

    #[tokio::test]
    async fn system_contract_answers_status_and_height() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;
        let tx = TxId::generate();
        gw.submit("ch", "cc", &tx, "CreateAsset", &args(&["A1", "{}"])).await.unwrap();

        let raw = gw
            .evaluate("ch", SYSTEM_CONTRACT, GET_TRANSACTION_BY_ID, &args(&["ch", tx.as_str()]))
            .await
            .unwrap();
        let processed: ProcessedTransaction = serde_json::from_slice(&raw).unwrap();
        assert_eq!(processed.validation_code, ValidationCode::valid());

        let raw = gw.evaluate("ch", SYSTEM_CONTRACT, GET_CHAIN_INFO, &args(&["ch"])).await.unwrap();
        let info: ChainInfo = serde_json::from_slice(&raw).unwrap();
        assert_eq!(info.height, 2);

        ledger.set_system_unavailable(true);
        let err = gw.evaluate("ch", SYSTEM_CONTRACT, GET_CHAIN_INFO, &args(&["ch"])).await;
        assert!(matches!(err, Err(TransportError::Timeout { phase: Phase::Query, .. })));
    }

    #[tokio::test]
    async fn evaluate_does_not_mutate_world_state() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;

        gw.evaluate("ch", "cc", "CreateAsset", &args(&["A1", "{}"])).await.unwrap();
        assert!(ledger.get("A1").is_none());
        let exists = gw.evaluate("ch", "cc", "AssetExists", &args(&["A1"])).await.unwrap();
        assert_eq!(exists, b"false");
    }

    #[tokio::test]
    async fn closed_gateway_refuses_calls() {
        let ledger = InMemoryLedger::new();
        let gw = gateway(&ledger).await;
        gw.close().await;
        let err = gw.evaluate("ch", "cc", "GetAllAssets", &[]).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[test]
    fn transfer_returns_previous_owner() {
        let mut world = BTreeMap::new();
        run_chaincode(&mut world, "CreateAsset", &args(&["A1", r#"{"Owner":"Tom"}"#])).unwrap();
        let out = run_chaincode(&mut world, "TransferAsset", &args(&["A1", "Ana"])).unwrap();
        let out: JsonValue = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["oldOwner"], "Tom");
        assert_eq!(world["A1"]["Owner"], "Ana");
    }
}
