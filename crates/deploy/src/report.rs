//! Per-spec outcome of a run.

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, TxHash};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use derive_more::{Deref, From};

use crate::error::{DeployError, SkipReason};

/// Addresses of the deployments available after a run, by spec name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, From)]
pub struct AddressBook(BTreeMap<String, Address>);

#[derive(Debug)]
pub enum SpecOutcome {
    /// Confirmed by an earlier run; nothing was submitted.
    Reused { address: Address },
    /// Newly confirmed in this run.
    Deployed { address: Address, tx_hash: TxHash },
    Failed { error: DeployError },
    Skipped { reason: SkipReason },
}

impl SpecOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SpecOutcome::Reused { .. } => "reused",
            SpecOutcome::Deployed { .. } => "deployed",
            SpecOutcome::Failed { .. } => "failed",
            SpecOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            SpecOutcome::Reused { address } | SpecOutcome::Deployed { address, .. } => {
                Some(*address)
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.address().is_some()
    }
}

#[derive(Debug)]
pub struct SpecReport {
    pub name: String,
    pub contract: String,
    pub outcome: SpecOutcome,
}

/// Result of scheduling a module against a network.
///
/// A run that is not fully successful still persisted its completed work in the
/// ledger; re-running the module picks up from there.
#[derive(Debug)]
pub struct DeploymentReport {
    pub module: String,
    pub network: String,
    pub chain_id: u64,
    /// One report per spec, in deployment order.
    pub specs: Vec<SpecReport>,
}

impl DeploymentReport {
    pub fn is_success(&self) -> bool {
        self.specs.iter().all(|s| s.outcome.is_success())
    }

    pub fn addresses(&self) -> AddressBook {
        self.specs
            .iter()
            .filter_map(|s| s.outcome.address().map(|a| (s.name.clone(), a)))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    /// Specs that failed or were skipped.
    pub fn failures(&self) -> impl Iterator<Item = &SpecReport> {
        self.specs.iter().filter(|s| !s.outcome.is_success())
    }

    pub fn outcome(&self, name: &str) -> Option<&SpecOutcome> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.outcome)
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_header(vec!["Deployment", "Contract", "Status", "Address", "Detail"]);

        for spec in &self.specs {
            let detail = match &spec.outcome {
                SpecOutcome::Reused { .. } => String::new(),
                SpecOutcome::Deployed { tx_hash, .. } => tx_hash.to_string(),
                SpecOutcome::Failed { error } => error.to_string(),
                SpecOutcome::Skipped { reason } => reason.to_string(),
            };
            table.add_row(vec![
                spec.name.clone(),
                spec.contract.clone(),
                spec.outcome.label().to_string(),
                spec.outcome
                    .address()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                detail,
            ]);
        }
        table
    }
}
