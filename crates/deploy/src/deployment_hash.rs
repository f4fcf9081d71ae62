use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::module::{ArgValue, DeploymentSpec};

/// The parts of a spec that, when changed, describe a different deployment.
///
/// The deployment name is the ledger key and therefore not part of the
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecFingerprint<'a> {
    pub contract: &'a str,
    pub args: &'a [ArgValue],
    pub signer: usize,
}

impl<'a> SpecFingerprint<'a> {
    pub fn from_spec(spec: &'a DeploymentSpec) -> Self {
        Self {
            contract: &spec.contract,
            args: &spec.args,
            signer: spec.signer,
        }
    }

    /// Compute a SHA-256 hash of the declaration.
    ///
    /// The hash is deterministic: the same declaration always produces the same hash.
    pub fn compute_hash(&self) -> String {
        // Struct and enum fields serialize in declaration order, so the JSON is stable.
        let json = serde_json::to_vec(self).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

/// Fingerprint of a spec, as stored in the ledger.
pub fn fingerprint(spec: &DeploymentSpec) -> String {
    SpecFingerprint::from_spec(spec).compute_hash()
}
