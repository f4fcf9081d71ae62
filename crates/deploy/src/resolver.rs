//! Constructor argument resolution.

use std::{collections::BTreeMap, fmt};

use alloy_core::primitives::Address;

use crate::{
    error::ResolveError,
    module::{ArgValue, Literal},
};

/// A concrete constructor argument, ready to be ABI-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructorArg {
    Literal(Literal),
    /// An environment value, verbatim.
    Text(String),
    /// The address of a deployment of the same run.
    Address(Address),
}

impl fmt::Display for ConstructorArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructorArg::Literal(literal) => fmt::Display::fmt(literal, f),
            ConstructorArg::Text(text) => f.write_str(text),
            ConstructorArg::Address(address) => fmt::Display::fmt(address, f),
        }
    }
}

/// Resolve every declared argument of a spec.
///
/// Arguments resolve independently and in order, but resolution is all or
/// nothing: the first failure is returned and no partial list is produced.
pub fn resolve(
    args: &[ArgValue],
    deployed: &BTreeMap<String, Address>,
    env: &BTreeMap<String, String>,
) -> Result<Vec<ConstructorArg>, ResolveError> {
    args.iter()
        .map(|arg| match arg {
            ArgValue::Literal(literal) => Ok(ConstructorArg::Literal(literal.clone())),
            ArgValue::Env(name) => env
                .get(name)
                .map(|value| ConstructorArg::Text(value.clone()))
                .ok_or_else(|| ResolveError::MissingEnv { name: name.clone() }),
            // The scheduler only resolves a spec once its dependencies are confirmed,
            // so a miss here means the ordering invariant was broken.
            ArgValue::Deployment(name) => deployed
                .get(name)
                .map(|address| ConstructorArg::Address(*address))
                .ok_or_else(|| ResolveError::UnresolvedReference { name: name.clone() }),
        })
        .collect()
}
