//! chainplan-deploy - Declarative smart-contract deployment.
//!
//! A [`Module`] declares named contract deployments whose constructor arguments
//! are literals, environment values or addresses of other deployments in the
//! same module. The [`Scheduler`] deploys them in dependency order against a
//! [`ChainClient`], recording every outcome in a [`Ledger`] so that re-running a
//! module only deploys what is still missing.

mod artifacts;
pub use artifacts::{Artifact, ArtifactProvider, HardhatArtifacts};

mod chain;
pub use chain::{
    ChainClient, DeployRequest, PendingDeployment, Receipt, RpcChainClient, RpcPendingDeployment,
};

mod config;
pub use config::{
    CONFIG_FILENAME, LOCALHOST_NETWORK, Network, NetworkConfig, ProjectConfig, SchedulerConfig,
};

mod deployment_hash;
pub use deployment_hash::{SpecFingerprint, fingerprint};

mod error;
pub use error::{
    ArtifactError, ChainError, DeployError, GraphError, LedgerError, ResolveError, RunError,
    SkipReason,
};

mod graph;
pub use graph::{DeploymentGraph, build_order};

mod ledger;
pub use ledger::{
    ADDRESSES_FILENAME, FileLedger, JOURNAL_FILENAME, Ledger, LedgerEntry, LedgerKey,
    LedgerStatus, MemoryLedger,
};

mod module;
pub use module::{ArgValue, DeploymentSpec, Literal, Module, ModuleBuilder};

mod report;
pub use report::{AddressBook, DeploymentReport, SpecOutcome, SpecReport};

mod resolver;
pub use resolver::{ConstructorArg, resolve};

mod rpc;

mod scheduler;
pub use scheduler::{DeployContext, Scheduler, Shutdown, ShutdownTrigger, SpecState};
