//! Compiled contract artifacts.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    json_abi::JsonAbi,
    primitives::Bytes,
};
use serde::Deserialize;

use crate::{error::ArtifactError, resolver::ConstructorArg};

/// Creation bytecode and ABI of a contract.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
}

impl Artifact {
    /// ABI types of the constructor parameters, in order.
    pub fn constructor_types(&self) -> Vec<String> {
        self.abi
            .constructor
            .as_ref()
            .map(|ctor| {
                ctor.inputs
                    .iter()
                    .map(|param| param.selector_type().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Human readable constructor signature, e.g. `constructor(address,uint256)`.
    pub fn constructor_signature(&self) -> String {
        format!("constructor({})", self.constructor_types().join(","))
    }

    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    pub fn deploy_data(&self, args: &[ConstructorArg]) -> Result<Bytes, ArtifactError> {
        let types = self.constructor_types();
        if types.len() != args.len() {
            return Err(self.encoding_error(format!(
                "{} expects {} arguments, got {}",
                self.constructor_signature(),
                types.len(),
                args.len()
            )));
        }

        let values = types
            .iter()
            .zip(args)
            .map(|(ty, arg)| {
                let ty = DynSolType::parse(ty)
                    .map_err(|e| self.encoding_error(format!("bad ABI type `{ty}`: {e}")))?;
                ty.coerce_str(&arg.to_string())
                    .map_err(|e| self.encoding_error(format!("`{arg}` is not a valid {ty}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut data = self.bytecode.to_vec();
        if !values.is_empty() {
            data.extend(DynSolValue::Tuple(values).abi_encode_params());
        }
        Ok(data.into())
    }

    fn encoding_error(&self, reason: String) -> ArtifactError {
        ArtifactError::Encoding {
            contract: self.contract_name.clone(),
            reason,
        }
    }
}

/// Source of compiled artifacts, keyed by contract reference.
pub trait ArtifactProvider: Send + Sync {
    fn artifact(&self, contract: &str) -> Result<Artifact, ArtifactError>;
}

impl ArtifactProvider for HashMap<String, Artifact> {
    fn artifact(&self, contract: &str) -> Result<Artifact, ArtifactError> {
        self.get(contract)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound {
                contract: contract.to_string(),
                dir: PathBuf::from("<memory>"),
            })
    }
}

/// Artifacts produced by a Hardhat compilation.
///
/// Hardhat writes `artifacts/contracts/<File>.sol/<Name>.json` next to a
/// `<Name>.dbg.json` debug file; any `<Name>.json` under the root is accepted.
#[derive(Debug, Clone)]
pub struct HardhatArtifacts {
    root: PathBuf,
}

impl HardhatArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn find(&self, dir: &Path, file_name: &str) -> Result<Option<PathBuf>, ArtifactError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ArtifactError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut subdirs = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ArtifactError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            if path.is_dir() {
                subdirs.push(path);
            } else if path.file_name().is_some_and(|name| name == file_name) {
                return Ok(Some(path));
            }
        }

        // Deterministic pick when several sources declare the same contract name.
        subdirs.sort();
        for subdir in subdirs {
            if let Some(found) = self.find(&subdir, file_name)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

impl ArtifactProvider for HardhatArtifacts {
    fn artifact(&self, contract: &str) -> Result<Artifact, ArtifactError> {
        let not_found = || ArtifactError::NotFound {
            contract: contract.to_string(),
            dir: self.root.clone(),
        };
        if !self.root.is_dir() {
            return Err(not_found());
        }

        let path = self
            .find(&self.root, &format!("{contract}.json"))?
            .ok_or_else(not_found)?;

        let content = std::fs::read_to_string(&path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        let artifact: Artifact =
            serde_json::from_str(&content).map_err(|source| ArtifactError::Parse {
                path: path.clone(),
                source,
            })?;

        if artifact.bytecode.is_empty() {
            return Err(ArtifactError::NotDeployable {
                contract: contract.to_string(),
            });
        }

        tracing::trace!(contract, path = %path.display(), "Artifact loaded");
        Ok(artifact)
    }
}
