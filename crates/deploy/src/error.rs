//! Error taxonomy for module validation, argument resolution and deployment.
//!
//! Errors that concern a single spec ([`DeployError`], [`SkipReason`]) are attached
//! to that spec in the [`crate::DeploymentReport`]. Errors that make the whole run
//! meaningless ([`RunError`]) abort it before or while scheduling.

use std::{path::PathBuf, time::Duration};

use alloy_core::primitives::TxHash;
use thiserror::Error;

/// Failures detected while building the deployment graph of a module.
///
/// These are raised before any submission happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("deployment `{name}` is declared more than once")]
    DuplicateName { name: String },
    #[error("deployment `{spec}` references unknown deployment `{missing}`")]
    UnknownReference { spec: String, missing: String },
    #[error("dependency cycle between deployments: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

/// Failures turning declared constructor arguments into concrete values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("environment value `{name}` is not set")]
    MissingEnv { name: String },
    #[error("deployment `{name}` has no address in this run")]
    UnresolvedReference { name: String },
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no artifact found for contract `{contract}` under {}", dir.display())]
    NotFound { contract: String, dir: PathBuf },
    #[error("failed to read artifact {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse artifact {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("contract `{contract}` has no creation bytecode (abstract or interface?)")]
    NotDeployable { contract: String },
    #[error("cannot encode constructor arguments for `{contract}`: {reason}")]
    Encoding { contract: String, reason: String },
}

/// Failures reported by a [`crate::ChainClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    /// The node answered with a JSON-RPC error object.
    #[error("node rejected the request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error(
        "node manages no account at signer index {index}; use a node with unlocked accounts (anvil, hardhat node, geth --dev)"
    )]
    UnknownSigner { index: usize },
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: TxHash },
    #[error("receipt of {tx_hash} carries no contract address")]
    MissingContractAddress { tx_hash: TxHash },
}

/// Why a single deployment failed.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("no receipt for {tx_hash} after {after:?}; ledger entry left pending")]
    Timeout { tx_hash: TxHash, after: Duration },
    #[error("could not fetch the receipt of {tx_hash}: {error}; ledger entry left pending")]
    ReceiptUnavailable { tx_hash: TxHash, error: ChainError },
    #[error("node did not acknowledge the deployment transaction after {after:?}")]
    SubmissionTimeout { after: Duration },
    #[error("transaction {tx_hash} from an earlier run is still unconfirmed; reconcile manually")]
    PendingReconciliation { tx_hash: TxHash },
}

/// Why a deployment was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("skipped due to upstream failure of `{upstream}`")]
    UpstreamFailure { upstream: String },
    #[error("run cancelled before this deployment started")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupted ledger record in {} at line {line}", path.display())]
    Corrupted {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize ledger record")]
    Serialize(#[source] serde_json::Error),
    #[error("ledger at {} is locked by another run", path.display())]
    Locked { path: PathBuf },
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A transaction went out but its pending entry could not be written.
    #[error("transaction {tx_hash} of `{spec}` was submitted but could not be recorded")]
    Unrecorded {
        spec: String,
        tx_hash: TxHash,
        #[source]
        source: LedgerError,
    },
}
