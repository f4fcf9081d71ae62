//! Declarative module descriptions.
//!
//! A [`Module`] is plain data: a named, ordered list of [`DeploymentSpec`]s whose
//! constructor arguments may reference each other. It can be written by hand in
//! TOML/JSON or built in code with [`ModuleBuilder`].
//!
//! ```toml
//! name = "DeployModule"
//!
//! [[deployments]]
//! name = "vault"
//! contract = "HoneyVault"
//!
//! [[deployments]]
//! name = "swapper"
//! contract = "TokenSwapper"
//! args = [{ deployment = "vault" }, { env = "WETH_ADDRESS" }]
//! ```

use std::{collections::HashSet, fmt, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// A literal constructor argument.
///
/// Values are kept in their declared form and coerced to the constructor's ABI
/// types at encoding time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Int(value.into())
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

/// A declared constructor argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    /// Used as is.
    Literal(Literal),
    /// Looked up by name in the run's environment.
    Env(String),
    /// Replaced by the address of another deployment of the same module.
    Deployment(String),
}

impl ArgValue {
    pub fn literal(value: impl Into<Literal>) -> Self {
        ArgValue::Literal(value.into())
    }

    pub fn env(name: impl Into<String>) -> Self {
        ArgValue::Env(name.into())
    }

    pub fn deployment(name: impl Into<String>) -> Self {
        ArgValue::Deployment(name.into())
    }

    /// The sibling deployment this argument depends on, if any.
    pub fn deployment_ref(&self) -> Option<&str> {
        match self {
            ArgValue::Deployment(name) => Some(name),
            _ => None,
        }
    }
}

/// One contract deployment declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Unique name of the deployment within its module.
    pub name: String,
    /// Artifact identifier handed to the artifact provider.
    pub contract: String,
    /// Constructor arguments, in constructor order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgValue>,
    /// Index of the account that signs the deployment transaction.
    #[serde(default)]
    pub signer: usize,
}

impl DeploymentSpec {
    /// Names of the sibling deployments referenced by this spec, in argument order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(ArgValue::deployment_ref)
    }
}

/// A named, ordered collection of deployment specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub deployments: Vec<DeploymentSpec>,
}

impl Module {
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder::new(name)
    }

    pub fn spec(&self, name: &str) -> Option<&DeploymentSpec> {
        self.deployments.iter().find(|spec| spec.name == name)
    }

    /// Check that deployment names are unique.
    pub fn validate_names(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for spec in &self.deployments {
            if !seen.insert(spec.name.as_str()) {
                return Err(GraphError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Load a module description from a TOML or JSON file.
    ///
    /// The format is picked from the file extension, TOML being the default.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read module from {}", path.display()))?;

        let module: Self = if is_json(path) {
            serde_json::from_str(&content).context("Failed to parse module file as JSON")?
        } else {
            toml::from_str(&content).context("Failed to parse module file as TOML")?
        };

        module
            .validate_names()
            .with_context(|| format!("Invalid module in {}", path.display()))?;

        tracing::debug!(path = %path.display(), module = %module.name, "Module loaded");
        Ok(module)
    }

    /// Save the module description, picking the format from the file extension.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).context("Failed to serialize module to JSON")?
        } else {
            toml::to_string_pretty(self).context("Failed to serialize module to TOML")?
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write module to {}", path.display()))?;
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Builder for a [`Module`].
///
/// # Example
///
/// ```
/// use chainplan_deploy::{ArgValue, Module};
///
/// let module = Module::builder("DeployModule")
///     .contract("vault", "HoneyVault", [])
///     .contract("swapper", "TokenSwapper", [ArgValue::deployment("vault")])
///     .build()
///     .unwrap();
/// assert_eq!(module.deployments.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    name: String,
    deployments: Vec<DeploymentSpec>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deployments: Vec::new(),
        }
    }

    /// Declare a deployment signed by account 0.
    pub fn contract(
        self,
        name: impl Into<String>,
        contract: impl Into<String>,
        args: impl IntoIterator<Item = ArgValue>,
    ) -> Self {
        self.contract_from(name, contract, args, 0)
    }

    /// Declare a deployment signed by the account at `signer`.
    pub fn contract_from(
        mut self,
        name: impl Into<String>,
        contract: impl Into<String>,
        args: impl IntoIterator<Item = ArgValue>,
        signer: usize,
    ) -> Self {
        self.deployments.push(DeploymentSpec {
            name: name.into(),
            contract: contract.into(),
            args: args.into_iter().collect(),
            signer,
        });
        self
    }

    pub fn build(self) -> Result<Module, GraphError> {
        let module = Module {
            name: self.name,
            deployments: self.deployments,
        };
        module.validate_names()?;
        Ok(module)
    }
}
