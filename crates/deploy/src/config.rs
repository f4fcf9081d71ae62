//! Project configuration (`Chainplan.toml`).
//!
//! ```toml
//! artifacts = "artifacts"
//! modules = "modules"
//! ledger = "deployments"
//!
//! [scheduler]
//! concurrency = 4
//! receipt_timeout_secs = 300
//!
//! [networks.berachain]
//! url = "https://rpc.berachain.com/"
//! chain_id = 80094
//!
//! [networks.berachain.env]
//! WETH_ADDRESS = "0x6969696969696969696969696969696969696969"
//! ```
//!
//! Every key can be overridden from the environment with the `CHAINPLAN_`
//! prefix, nested keys being separated by `__` (e.g.
//! `CHAINPLAN_SCHEDULER__CONCURRENCY=1`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// The default name of the project configuration file.
pub const CONFIG_FILENAME: &str = "Chainplan.toml";

/// Name of the network available without configuration.
pub const LOCALHOST_NETWORK: &str = "localhost";

/// Configuration of the deployment scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of deployments in flight at once.
    pub concurrency: usize,
    /// Deadline for a submitted deployment to be mined.
    pub receipt_timeout_secs: u64,
    /// Interval between receipt polls.
    pub poll_interval_ms: u64,
    /// Ignore confirmed ledger entries and deploy everything again.
    pub redeploy: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            receipt_timeout_secs: 300,
            poll_interval_ms: 1000,
            redeploy: false,
        }
    }
}

impl SchedulerConfig {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub url: String,
    pub chain_id: u64,
    /// Values for `env` constructor arguments on this network.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl NetworkConfig {
    /// A local development node (Hardhat node, Anvil).
    pub fn localhost() -> Self {
        Self {
            url: "http://127.0.0.1:8545".to_string(),
            chain_id: 31337,
            env: BTreeMap::new(),
        }
    }
}

/// Network identity attached to ledger entries and reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the compiled artifacts.
    pub artifacts: PathBuf,
    /// Directory searched for module files given by name.
    pub modules: PathBuf,
    /// Root of the deployment ledgers.
    pub ledger: PathBuf,
    pub scheduler: SchedulerConfig,
    pub networks: BTreeMap<String, NetworkConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            artifacts: PathBuf::from("artifacts"),
            modules: PathBuf::from("modules"),
            ledger: PathBuf::from("deployments"),
            scheduler: SchedulerConfig::default(),
            networks: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Load the configuration, layering defaults, the TOML file (if it exists) and
    /// `CHAINPLAN_*` environment variables.
    ///
    /// Relative paths are resolved against the directory of the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let mut config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHAINPLAN_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        if let Some(base) = config_path.parent() {
            for dir in [&mut config.artifacts, &mut config.modules, &mut config.ledger] {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }

        tracing::debug!(
            path = %config_path.display(),
            networks = config.networks.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Look up a network by name. `localhost` is always available.
    pub fn network(&self, name: &str) -> Result<NetworkConfig> {
        match self.networks.get(name) {
            Some(network) => Ok(network.clone()),
            None if name == LOCALHOST_NETWORK => Ok(NetworkConfig::localhost()),
            None => anyhow::bail!(
                "Unknown network `{}` (configured: {})",
                name,
                self.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Locate a module file: an existing path, or `<modules>/<name>.toml` / `.json`.
    pub fn module_path(&self, module: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(module);
        if direct.is_file() {
            return Ok(direct);
        }
        ["toml", "json"]
            .iter()
            .map(|ext| self.modules.join(format!("{module}.{ext}")))
            .find(|candidate| candidate.is_file())
            .with_context(|| {
                format!(
                    "Module `{}` not found (looked in {})",
                    module,
                    self.modules.display()
                )
            })
    }
}
