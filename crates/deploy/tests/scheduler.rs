//! Scheduler tests against an in-process chain.
//!
//! Run with: cargo test --test scheduler

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy_core::primitives::{Address, TxHash};
use chainplan_deploy::{
    ArgValue, Artifact, ChainClient, ChainError, ConstructorArg, DeployContext, DeployError,
    DeployRequest, DeploymentReport, FileLedger, GraphError, Ledger, LedgerEntry, LedgerError,
    LedgerKey,
    LedgerStatus, MemoryLedger, Module, Network, PendingDeployment, Receipt, ResolveError,
    RunError, Scheduler, SchedulerConfig, Shutdown, ShutdownTrigger, SkipReason, SpecOutcome,
    fingerprint,
};
use serde_json::json;
use tempdir::TempDir;

const CHAIN_ID: u64 = 31337;
const WETH: &str = "0x6969696969696969696969696969696969696969";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Confirm,
    Reject,
    Revert,
    Hang,
    /// The transaction is sent but the node stops answering receipt polls.
    LoseReceipt,
    /// The node never acknowledges the transaction.
    HangSubmit,
}

/// Chain that mines creations according to a per-spec behavior.
#[derive(Default)]
struct MockChain {
    behaviors: HashMap<String, Behavior>,
    receipts: HashMap<TxHash, Result<Option<Receipt>, ChainError>>,
    receipt_lookup_hangs: bool,
    cancel_on_submit: Option<ShutdownTrigger>,
    receipt_delay: Duration,
    /// Offset of generated addresses, so that redeployments get new ones.
    base: u8,
    submissions: Mutex<Vec<DeployRequest>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockChain {
    fn new() -> Self {
        Self::default()
    }

    fn with(mut self, spec: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(spec.to_string(), behavior);
        self
    }

    fn with_base(mut self, base: u8) -> Self {
        self.base = base;
        self
    }

    fn submitted(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .submissions
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    fn request(&self, spec: &str) -> DeployRequest {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == spec)
            .cloned()
            .unwrap()
    }
}

struct MockPending {
    tx_hash: TxHash,
    address: Address,
    behavior: Behavior,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl PendingDeployment for MockPending {
    fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    async fn await_receipt(self) -> Result<Receipt, ChainError> {
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Revert => Err(ChainError::Reverted {
                tx_hash: self.tx_hash,
            }),
            Behavior::LoseReceipt => Err(ChainError::Rpc("connection reset by peer".into())),
            _ => Ok(Receipt {
                tx_hash: self.tx_hash,
                address: self.address,
                block_number: Some(1),
            }),
        }
    }
}

impl ChainClient for MockChain {
    type Pending = MockPending;

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(CHAIN_ID)
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<MockPending, ChainError> {
        let nonce = {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(request.clone());
            self.base + submissions.len() as u8
        };
        if let Some(trigger) = &self.cancel_on_submit {
            trigger.cancel();
        }

        let behavior = self
            .behaviors
            .get(&request.name)
            .copied()
            .unwrap_or(Behavior::Confirm);
        match behavior {
            Behavior::Reject => return Err(ChainError::Rpc("insufficient funds for gas".into())),
            Behavior::HangSubmit => return std::future::pending().await,
            _ => {}
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        Ok(MockPending {
            tx_hash: TxHash::with_last_byte(nonce),
            address: Address::with_last_byte(nonce),
            behavior,
            delay: self.receipt_delay,
            in_flight: self.in_flight.clone(),
        })
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        if self.receipt_lookup_hangs {
            return std::future::pending().await;
        }
        self.receipts.get(&tx_hash).cloned().unwrap_or(Ok(None))
    }
}

fn artifact(name: &str, inputs: &[&str]) -> (String, Artifact) {
    let abi = if inputs.is_empty() {
        json!([])
    } else {
        let inputs: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(i, ty)| json!({ "name": format!("arg{i}"), "type": ty, "internalType": ty }))
            .collect();
        json!([{ "type": "constructor", "inputs": inputs, "stateMutability": "nonpayable" }])
    };
    let artifact = serde_json::from_value(json!({
        "contractName": name,
        "abi": abi,
        "bytecode": "0x6080604052",
    }))
    .unwrap();
    (name.to_string(), artifact)
}

fn artifacts() -> HashMap<String, Artifact> {
    HashMap::from([
        artifact("SwapQuoteQuery", &[]),
        artifact("HoneyVault", &[]),
        artifact("TokenSwapper", &["address", "address"]),
        artifact("TicketContract", &["address", "uint256"]),
        artifact("Wrapper", &["address"]),
        artifact("Counter", &["uint256"]),
    ])
}

/// vault <- swapper <- ticket, plus an independent query.
fn honey_module() -> Module {
    Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .contract(
            "swapper",
            "TokenSwapper",
            [ArgValue::deployment("vault"), ArgValue::env("WETH_ADDRESS")],
        )
        .contract(
            "ticket",
            "TicketContract",
            [ArgValue::deployment("swapper"), ArgValue::literal(100)],
        )
        .contract("query", "SwapQuoteQuery", [])
        .build()
        .unwrap()
}

fn network() -> Network {
    Network {
        name: "localhost".into(),
        chain_id: CHAIN_ID,
    }
}

fn env() -> BTreeMap<String, String> {
    BTreeMap::from([("WETH_ADDRESS".to_string(), WETH.to_string())])
}

async fn run_with<L: Ledger>(
    scheduler: &Scheduler,
    module: &Module,
    ledger: &mut L,
    chain: &MockChain,
    env: &BTreeMap<String, String>,
) -> Result<DeploymentReport, RunError> {
    let network = network();
    let artifacts = artifacts();
    scheduler
        .run(
            module,
            DeployContext {
                network: &network,
                env,
                ledger,
                chain,
                artifacts: &artifacts,
            },
        )
        .await
}

async fn run<L: Ledger>(module: &Module, ledger: &mut L, chain: &MockChain) -> DeploymentReport {
    run_with(&Scheduler::default(), module, ledger, chain, &env())
        .await
        .unwrap()
}

fn status<L: Ledger>(ledger: &L, spec: &str) -> Option<LedgerStatus> {
    ledger
        .get(&LedgerKey::new(CHAIN_ID, "DeployModule", spec))
        .unwrap()
        .map(|e| e.status)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_full_run_wires_addresses_into_dependents() {
    init_tracing();
    let module = honey_module();
    let chain = MockChain::new();
    let mut ledger = MemoryLedger::new();

    let report = run(&module, &mut ledger, &chain).await;

    assert!(report.is_success(), "{}", report.to_table());
    assert_eq!(chain.submitted(), vec!["query", "swapper", "ticket", "vault"]);

    let addresses = report.addresses();
    assert_eq!(addresses.len(), 4);
    assert_eq!(
        chain.request("swapper").args,
        vec![
            ConstructorArg::Address(addresses["vault"]),
            ConstructorArg::Text(WETH.into()),
        ]
    );
    assert_eq!(
        chain.request("ticket").args[0],
        ConstructorArg::Address(addresses["swapper"])
    );

    // Deployment order is reported, not completion order.
    let names: Vec<_> = report.specs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["vault", "swapper", "ticket", "query"]);

    for spec in ["vault", "swapper", "ticket", "query"] {
        assert_eq!(status(&ledger, spec), Some(LedgerStatus::Confirmed));
    }
}

#[tokio::test]
async fn test_partial_failure_resumes_from_ledger() {
    init_tracing();
    let temp_dir = TempDir::new("chainplan-test").expect("Failed to create temp dir");
    let module = honey_module();

    let first = {
        let mut ledger = FileLedger::open(temp_dir.path(), CHAIN_ID).unwrap();
        let chain = MockChain::new().with("swapper", Behavior::Reject);
        let report = run(&module, &mut ledger, &chain).await;

        assert_eq!(chain.submitted(), vec!["query", "swapper", "vault"]);
        assert_eq!(status(&ledger, "swapper"), Some(LedgerStatus::Failed));
        assert_eq!(status(&ledger, "ticket"), None);
        report
    };

    assert!(!first.is_success());
    assert!(matches!(first.outcome("vault"), Some(SpecOutcome::Deployed { .. })));
    assert!(matches!(first.outcome("query"), Some(SpecOutcome::Deployed { .. })));
    assert!(matches!(
        first.outcome("swapper"),
        Some(SpecOutcome::Failed {
            error: DeployError::Chain(ChainError::Rpc(_))
        })
    ));
    assert!(matches!(
        first.outcome("ticket"),
        Some(SpecOutcome::Skipped {
            reason: SkipReason::UpstreamFailure { upstream }
        }) if upstream == "swapper"
    ));

    // The ledger was dropped with the first run; a new process picks it up.
    let mut ledger = FileLedger::open(temp_dir.path(), CHAIN_ID).unwrap();
    let chain = MockChain::new().with_base(10);
    let second = run(&module, &mut ledger, &chain).await;

    assert!(second.is_success(), "{}", second.to_table());
    assert_eq!(chain.submitted(), vec!["swapper", "ticket"]);
    assert!(matches!(second.outcome("vault"), Some(SpecOutcome::Reused { .. })));
    assert!(matches!(second.outcome("query"), Some(SpecOutcome::Reused { .. })));
    assert_eq!(second.addresses()["vault"], first.addresses()["vault"]);
    assert_eq!(
        chain.request("swapper").args[0],
        ConstructorArg::Address(first.addresses()["vault"])
    );
}

#[tokio::test]
async fn test_independent_spec_survives_sibling_failure() {
    let module = Module::builder("DeployModule")
        .contract("a", "HoneyVault", [])
        .contract("b", "Wrapper", [ArgValue::deployment("a")])
        .contract("c", "Counter", [ArgValue::env("X")])
        .build()
        .unwrap();
    let env = BTreeMap::from([("X".to_string(), "42".to_string())]);
    let mut ledger = MemoryLedger::new();

    let chain = MockChain::new().with("b", Behavior::Reject);
    let report = run_with(&Scheduler::default(), &module, &mut ledger, &chain, &env)
        .await
        .unwrap();

    assert!(matches!(report.outcome("a"), Some(SpecOutcome::Deployed { .. })));
    assert!(matches!(report.outcome("b"), Some(SpecOutcome::Failed { .. })));
    assert!(matches!(report.outcome("c"), Some(SpecOutcome::Deployed { .. })));
    assert_eq!(
        chain.request("c").args,
        vec![ConstructorArg::Text("42".into())]
    );

    let chain = MockChain::new().with_base(10);
    let report = run_with(&Scheduler::default(), &module, &mut ledger, &chain, &env)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(chain.submitted(), vec!["b"]);
    assert_eq!(report.addresses().len(), 3);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();

    let first = run(&module, &mut ledger, &MockChain::new()).await;
    let chain = MockChain::new().with_base(10);
    let second = run(&module, &mut ledger, &chain).await;

    assert!(chain.submitted().is_empty());
    assert!(second.is_success());
    assert_eq!(second.addresses(), first.addresses());
    assert!(second
        .specs
        .iter()
        .all(|s| matches!(s.outcome, SpecOutcome::Reused { .. })));
}

#[tokio::test]
async fn test_revert_skips_transitive_dependents() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();
    let chain = MockChain::new().with("vault", Behavior::Revert);

    let report = run(&module, &mut ledger, &chain).await;

    assert_eq!(chain.submitted(), vec!["query", "vault"]);
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Failed {
            error: DeployError::Chain(ChainError::Reverted { .. })
        })
    ));
    for spec in ["swapper", "ticket"] {
        assert!(matches!(
            report.outcome(spec),
            Some(SpecOutcome::Skipped {
                reason: SkipReason::UpstreamFailure { upstream }
            }) if upstream == "vault"
        ));
    }

    let entry = ledger
        .get(&LedgerKey::new(CHAIN_ID, "DeployModule", "vault"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert!(entry.tx_hash.is_some());
    assert!(entry.error.unwrap().contains("reverted"));
}

#[tokio::test]
async fn test_missing_env_fails_before_submission() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();
    let chain = MockChain::new();

    let report = run_with(
        &Scheduler::default(),
        &module,
        &mut ledger,
        &chain,
        &BTreeMap::new(),
    )
    .await
    .unwrap();

    assert_eq!(chain.submitted(), vec!["query", "vault"]);
    assert!(matches!(
        report.outcome("swapper"),
        Some(SpecOutcome::Failed {
            error: DeployError::Resolve(ResolveError::MissingEnv { name })
        }) if name == "WETH_ADDRESS"
    ));
    assert!(matches!(
        report.outcome("ticket"),
        Some(SpecOutcome::Skipped { .. })
    ));
    // Nothing was submitted for the swapper, so nothing was recorded.
    assert_eq!(status(&ledger, "swapper"), None);
}

#[tokio::test]
async fn test_missing_artifact_fails_the_spec() {
    let module = Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .contract("ghost", "NotCompiled", [])
        .build()
        .unwrap();
    let mut ledger = MemoryLedger::new();
    let chain = MockChain::new();

    let report = run(&module, &mut ledger, &chain).await;

    assert_eq!(chain.submitted(), vec!["vault"]);
    assert!(matches!(
        report.outcome("ghost"),
        Some(SpecOutcome::Failed {
            error: DeployError::Artifact(_)
        })
    ));
}

#[tokio::test]
async fn test_graph_errors_abort_before_submission() {
    let chain = MockChain::new();
    let mut ledger = MemoryLedger::new();

    let unknown = Module::builder("DeployModule")
        .contract("swapper", "TokenSwapper", [ArgValue::deployment("vault")])
        .contract("query", "SwapQuoteQuery", [])
        .build()
        .unwrap();
    let err = run_with(&Scheduler::default(), &unknown, &mut ledger, &chain, &env())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Graph(GraphError::UnknownReference { ref spec, ref missing })
            if spec == "swapper" && missing == "vault"
    ));

    let cyclic = Module::builder("DeployModule")
        .contract("a", "HoneyVault", [ArgValue::deployment("b")])
        .contract("b", "HoneyVault", [ArgValue::deployment("a")])
        .build()
        .unwrap();
    let err = run_with(&Scheduler::default(), &cyclic, &mut ledger, &chain, &env())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Graph(GraphError::Cycle { .. })));

    assert!(chain.submitted().is_empty());
    assert!(ledger.entries(CHAIN_ID, "DeployModule").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_receipt_timeout_leaves_entry_pending_then_reconciles() {
    let module = Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .build()
        .unwrap();
    let scheduler = Scheduler::new(SchedulerConfig {
        receipt_timeout_secs: 1,
        ..Default::default()
    });
    let mut ledger = MemoryLedger::new();

    let chain = MockChain::new().with("vault", Behavior::Hang);
    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    let tx_hash = match report.outcome("vault") {
        Some(SpecOutcome::Failed {
            error: DeployError::Timeout { tx_hash, after },
        }) => {
            assert_eq!(*after, Duration::from_secs(1));
            *tx_hash
        }
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Pending));

    // The transaction got mined in the meantime: no second submission.
    let address = Address::with_last_byte(0xaa);
    let mut chain = MockChain::new();
    chain.receipts.insert(
        tx_hash,
        Ok(Some(Receipt {
            tx_hash,
            address,
            block_number: Some(7),
        })),
    );
    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    assert!(chain.submitted().is_empty());
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Reused { address: a }) if *a == address
    ));
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Confirmed));
}

fn mined(tx_hash: TxHash, address: Address) -> Result<Option<Receipt>, ChainError> {
    Ok(Some(Receipt {
        tx_hash,
        address,
        block_number: Some(7),
    }))
}

/// Memory ledger whose disk is full whenever a submission is recorded.
#[derive(Default)]
struct FullDiskLedger(MemoryLedger);

impl Ledger for FullDiskLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, LedgerError> {
        self.0.get(key)
    }

    fn put(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        if entry.status == LedgerStatus::Pending {
            return Err(LedgerError::Io {
                path: "journal.jsonl".into(),
                source: std::io::Error::other("no space left on device"),
            });
        }
        self.0.put(entry)
    }

    fn entries(&self, chain_id: u64, module: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.0.entries(chain_id, module)
    }
}

fn pending_entry(spec: &str, contract: &str, tx_hash: TxHash, module: &Module) -> LedgerEntry {
    LedgerEntry {
        chain_id: CHAIN_ID,
        network: "localhost".into(),
        module: "DeployModule".into(),
        spec: spec.into(),
        contract: contract.into(),
        status: LedgerStatus::Pending,
        address: None,
        tx_hash: Some(tx_hash),
        error: None,
        fingerprint: fingerprint(module.spec(spec).unwrap()),
        updated_at: 0,
    }
}

#[tokio::test]
async fn test_unknown_pending_transaction_is_not_resubmitted() {
    let module = honey_module();
    let tx_hash = TxHash::with_last_byte(0x42);
    let mut ledger = MemoryLedger::new();
    ledger
        .put(pending_entry("vault", "HoneyVault", tx_hash, &module))
        .unwrap();
    let chain = MockChain::new();

    let report = run(&module, &mut ledger, &chain).await;

    assert_eq!(chain.submitted(), vec!["query"]);
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Failed {
            error: DeployError::PendingReconciliation { tx_hash: t }
        }) if *t == tx_hash
    ));
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Pending));
}

#[tokio::test]
async fn test_reverted_pending_transaction_is_resubmitted() {
    let module = honey_module();
    let tx_hash = TxHash::with_last_byte(0x42);
    let mut ledger = MemoryLedger::new();
    ledger
        .put(pending_entry("vault", "HoneyVault", tx_hash, &module))
        .unwrap();
    let mut chain = MockChain::new();
    chain
        .receipts
        .insert(tx_hash, Err(ChainError::Reverted { tx_hash }));

    let report = run(&module, &mut ledger, &chain).await;

    assert!(report.is_success(), "{}", report.to_table());
    assert_eq!(chain.submitted(), vec!["query", "swapper", "ticket", "vault"]);
    assert!(matches!(report.outcome("vault"), Some(SpecOutcome::Deployed { .. })));
}

#[tokio::test]
async fn test_redeploy_ignores_confirmed_entries() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();
    let first = run(&module, &mut ledger, &MockChain::new()).await;

    let scheduler = Scheduler::new(SchedulerConfig {
        redeploy: true,
        ..Default::default()
    });
    let chain = MockChain::new().with_base(10);
    let second = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    assert!(second.is_success());
    assert_eq!(chain.submitted().len(), 4);
    assert_ne!(second.addresses()["vault"], first.addresses()["vault"]);

    let vault = ledger
        .get(&LedgerKey::new(CHAIN_ID, "DeployModule", "vault"))
        .unwrap()
        .unwrap();
    assert_eq!(vault.confirmed_address(), Some(second.addresses()["vault"]));
}

#[tokio::test]
async fn test_changed_declaration_is_reused_with_warning() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();
    let first = run(&module, &mut ledger, &MockChain::new()).await;

    let changed = Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .contract(
            "swapper",
            "TokenSwapper",
            [ArgValue::deployment("vault"), ArgValue::env("WETH_ADDRESS")],
        )
        .contract(
            "ticket",
            "TicketContract",
            [ArgValue::deployment("swapper"), ArgValue::literal(200)],
        )
        .contract("query", "SwapQuoteQuery", [])
        .build()
        .unwrap();
    let chain = MockChain::new();
    let second = run(&changed, &mut ledger, &chain).await;

    assert!(chain.submitted().is_empty());
    assert_eq!(second.addresses()["ticket"], first.addresses()["ticket"]);
}

#[tokio::test]
async fn test_cancellation_stops_new_starts() {
    let module = honey_module();
    let (trigger, shutdown) = Shutdown::channel();
    let scheduler = Scheduler::new(SchedulerConfig {
        concurrency: 1,
        ..Default::default()
    })
    .with_shutdown(shutdown);
    let mut ledger = MemoryLedger::new();
    let chain = MockChain {
        cancel_on_submit: Some(trigger),
        ..MockChain::new()
    };

    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    // The deployment in flight at cancellation is still awaited and recorded.
    assert_eq!(chain.submitted(), vec!["vault"]);
    assert!(matches!(report.outcome("vault"), Some(SpecOutcome::Deployed { .. })));
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Confirmed));
    for spec in ["swapper", "ticket", "query"] {
        assert!(matches!(
            report.outcome(spec),
            Some(SpecOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        ));
    }
}

#[tokio::test]
async fn test_concurrency_limit() {
    let module = (0..6)
        .fold(Module::builder("DeployModule"), |builder, i| {
            builder.contract(format!("query{i}"), "SwapQuoteQuery", [])
        })
        .build()
        .unwrap();
    let scheduler = Scheduler::new(SchedulerConfig {
        concurrency: 2,
        ..Default::default()
    });
    let mut ledger = MemoryLedger::new();
    let chain = MockChain {
        receipt_delay: Duration::from_millis(20),
        ..MockChain::new()
    };

    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(chain.submitted().len(), 6);
    let max = chain.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 2, "{max} deployments in flight");
}

#[tokio::test]
async fn test_lost_receipt_leaves_entry_pending_then_reconciles() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();

    let chain = MockChain::new().with("vault", Behavior::LoseReceipt);
    let report = run(&module, &mut ledger, &chain).await;

    let tx_hash = match report.outcome("vault") {
        Some(SpecOutcome::Failed {
            error: DeployError::ReceiptUnavailable { tx_hash, error },
        }) => {
            assert!(matches!(error, ChainError::Rpc(_)));
            *tx_hash
        }
        other => panic!("unexpected outcome: {other:?}"),
    };
    let entry = ledger
        .get(&LedgerKey::new(CHAIN_ID, "DeployModule", "vault"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, LedgerStatus::Pending);
    assert_eq!(entry.tx_hash, Some(tx_hash));

    // The transaction was mined after all: it is picked up, not sent again.
    let address = Address::with_last_byte(0xaa);
    let mut chain = MockChain::new().with_base(10);
    chain.receipts.insert(tx_hash, mined(tx_hash, address));
    let report = run(&module, &mut ledger, &chain).await;

    assert!(report.is_success(), "{}", report.to_table());
    assert_eq!(chain.submitted(), vec!["swapper", "ticket"]);
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Reused { address: a }) if *a == address
    ));
    assert_eq!(
        chain.request("swapper").args[0],
        ConstructorArg::Address(address)
    );
}

#[tokio::test]
async fn test_failed_entry_with_mined_transaction_is_reused() {
    let module = honey_module();
    let tx_hash = TxHash::with_last_byte(0x42);
    let address = Address::with_last_byte(0xaa);
    let mut ledger = MemoryLedger::new();
    ledger
        .put(LedgerEntry {
            status: LedgerStatus::Failed,
            error: Some("rpc error: connection reset by peer".into()),
            ..pending_entry("vault", "HoneyVault", tx_hash, &module)
        })
        .unwrap();
    let mut chain = MockChain::new();
    chain.receipts.insert(tx_hash, mined(tx_hash, address));

    let report = run(&module, &mut ledger, &chain).await;

    assert!(report.is_success(), "{}", report.to_table());
    assert_eq!(chain.submitted(), vec!["query", "swapper", "ticket"]);
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Reused { address: a }) if *a == address
    ));
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Confirmed));
}

#[tokio::test]
async fn test_reverted_entry_is_deployed_again() {
    let module = honey_module();
    let mut ledger = MemoryLedger::new();
    let chain = MockChain::new().with("vault", Behavior::Revert);
    let first = run(&module, &mut ledger, &chain).await;
    let tx_hash = match first.outcome("vault") {
        Some(SpecOutcome::Failed {
            error: DeployError::Chain(ChainError::Reverted { tx_hash }),
        }) => *tx_hash,
        other => panic!("unexpected outcome: {other:?}"),
    };

    let mut chain = MockChain::new().with_base(10);
    chain
        .receipts
        .insert(tx_hash, Err(ChainError::Reverted { tx_hash }));
    let second = run(&module, &mut ledger, &chain).await;

    assert!(second.is_success(), "{}", second.to_table());
    assert_eq!(chain.submitted(), vec!["swapper", "ticket", "vault"]);
    assert!(matches!(second.outcome("vault"), Some(SpecOutcome::Deployed { .. })));
}

#[tokio::test]
async fn test_failed_entry_with_unknown_transaction_is_deployed_again() {
    let module = honey_module();
    let tx_hash = TxHash::with_last_byte(0x42);
    let mut ledger = MemoryLedger::new();
    ledger
        .put(LedgerEntry {
            status: LedgerStatus::Failed,
            ..pending_entry("vault", "HoneyVault", tx_hash, &module)
        })
        .unwrap();
    let chain = MockChain::new();

    let report = run(&module, &mut ledger, &chain).await;

    assert!(report.is_success(), "{}", report.to_table());
    assert_eq!(chain.submitted(), vec!["query", "swapper", "ticket", "vault"]);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_submission_times_out() {
    let module = Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .contract("query", "SwapQuoteQuery", [])
        .build()
        .unwrap();
    let scheduler = Scheduler::new(SchedulerConfig {
        receipt_timeout_secs: 1,
        ..Default::default()
    });
    let mut ledger = MemoryLedger::new();
    let chain = MockChain::new().with("vault", Behavior::HangSubmit);

    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Failed {
            error: DeployError::SubmissionTimeout { after }
        }) if *after == Duration::from_secs(1)
    ));
    assert!(matches!(report.outcome("query"), Some(SpecOutcome::Deployed { .. })));

    let entry = ledger
        .get(&LedgerKey::new(CHAIN_ID, "DeployModule", "vault"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert_eq!(entry.tx_hash, None);
    assert!(entry.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_receipt_lookup_times_out() {
    let module = honey_module();
    let tx_hash = TxHash::with_last_byte(0x42);
    let scheduler = Scheduler::new(SchedulerConfig {
        receipt_timeout_secs: 1,
        ..Default::default()
    });
    let mut ledger = MemoryLedger::new();
    ledger
        .put(pending_entry("vault", "HoneyVault", tx_hash, &module))
        .unwrap();
    let chain = MockChain {
        receipt_lookup_hangs: true,
        ..MockChain::new()
    };

    let report = run_with(&scheduler, &module, &mut ledger, &chain, &env())
        .await
        .unwrap();

    assert_eq!(chain.submitted(), vec!["query"]);
    assert!(matches!(
        report.outcome("vault"),
        Some(SpecOutcome::Failed {
            error: DeployError::Timeout { tx_hash: t, .. }
        }) if *t == tx_hash
    ));
    assert_eq!(status(&ledger, "vault"), Some(LedgerStatus::Pending));
}

#[tokio::test]
async fn test_unrecorded_submission_aborts_with_tx_hash() {
    let module = Module::builder("DeployModule")
        .contract("vault", "HoneyVault", [])
        .build()
        .unwrap();
    let mut ledger = FullDiskLedger::default();
    let chain = MockChain::new();

    let err = run_with(&Scheduler::default(), &module, &mut ledger, &chain, &env())
        .await
        .unwrap_err();

    match err {
        RunError::Unrecorded {
            spec,
            tx_hash,
            source: LedgerError::Io { .. },
        } => {
            assert_eq!(spec, "vault");
            assert_eq!(tx_hash, TxHash::with_last_byte(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(chain.submitted(), vec!["vault"]);
}
