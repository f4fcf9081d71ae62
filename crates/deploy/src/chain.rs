//! Chain client seam.
//!
//! The scheduler only needs to submit a creation transaction, wait for its
//! receipt and look up receipts of earlier submissions. [`RpcChainClient`]
//! implements this over plain JSON-RPC against a node that manages the signing
//! accounts itself (Anvil, Hardhat node, Geth dev mode, ...).

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, Bytes, TxHash};
use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use url::Url;

use crate::{error::ChainError, resolver::ConstructorArg, rpc};

/// Everything needed to submit one contract creation.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Deployment name within the module, for diagnostics.
    pub name: String,
    /// Artifact identifier.
    pub contract: String,
    /// Resolved constructor arguments, already encoded into `data`.
    pub args: Vec<ConstructorArg>,
    /// Creation bytecode followed by the encoded constructor arguments.
    pub data: Bytes,
    /// Index of the signing account.
    pub signer: usize,
}

/// Successful contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub address: Address,
    pub block_number: Option<u64>,
}

/// A submitted creation transaction.
pub trait PendingDeployment: Send + 'static {
    fn tx_hash(&self) -> TxHash;

    /// Wait until the transaction is mined.
    ///
    /// Implementations may wait forever; the scheduler applies its own deadline.
    fn await_receipt(self) -> impl Future<Output = Result<Receipt, ChainError>> + Send;
}

/// Submits deployments to a chain.
pub trait ChainClient: Send + Sync {
    type Pending: PendingDeployment;

    /// Chain ID reported by the node.
    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Submit a creation transaction.
    fn deploy(
        &self,
        request: &DeployRequest,
    ) -> impl Future<Output = Result<Self::Pending, ChainError>> + Send;

    /// Look up the receipt of an earlier submission.
    ///
    /// `Ok(None)` means the transaction is unknown or not mined yet; a reverted
    /// transaction is reported as [`ChainError::Reverted`].
    fn receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<Option<Receipt>, ChainError>> + Send;
}

/// Receipt fields returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<String>,
    contract_address: Option<Address>,
    block_number: Option<String>,
}

impl RpcReceipt {
    fn into_receipt(self, tx_hash: TxHash) -> Result<Receipt, ChainError> {
        if self.status.as_deref() == Some("0x0") {
            return Err(ChainError::Reverted { tx_hash });
        }
        let address = self
            .contract_address
            .ok_or(ChainError::MissingContractAddress { tx_hash })?;
        Ok(Receipt {
            tx_hash,
            address,
            block_number: self
                .block_number
                .as_deref()
                .and_then(|n| rpc::parse_quantity(n).ok()),
        })
    }
}

fn rpc_error(err: anyhow::Error) -> ChainError {
    match err.downcast_ref::<rpc::JsonRpcError>() {
        Some(rejection) => ChainError::Rejected {
            code: rejection.code,
            message: match &rejection.data {
                Some(data) => format!("{} (data: {data})", rejection.message),
                None => rejection.message.clone(),
            },
        },
        None => ChainError::Rpc(format!("{err:#}")),
    }
}

async fn fetch_receipt(
    client: &reqwest::Client,
    url: &str,
    tx_hash: TxHash,
) -> Result<Option<RpcReceipt>, anyhow::Error> {
    rpc::json_rpc_call(
        client,
        url,
        "eth_getTransactionReceipt",
        vec![serde_json::json!(tx_hash)],
    )
    .await
}

/// JSON-RPC chain client using node-managed accounts.
///
/// Transactions are sent with `eth_sendTransaction` from `eth_accounts[signer]`,
/// so the node must hold unlocked accounts. Public RPC endpoints have none; point
/// it at a local fork instead (`anvil --fork-url <rpc>`).
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    client: reqwest::Client,
    url: Url,
    poll_interval: Duration,
}

impl RpcChainClient {
    pub fn new(url: &str, poll_interval: Duration) -> Result<Self, anyhow::Error> {
        let url = Url::parse(url).with_context(|| format!("Invalid RPC URL: {}", url))?;
        Ok(Self {
            client: rpc::create_client()?,
            url,
            poll_interval,
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, ChainError> {
        rpc::json_rpc_call(&self.client, self.url.as_str(), method, params)
            .await
            .map_err(rpc_error)
    }

    async fn signer_address(&self, index: usize) -> Result<Address, ChainError> {
        let accounts: Vec<Address> = self.call("eth_accounts", vec![]).await?;
        accounts
            .get(index)
            .copied()
            .ok_or(ChainError::UnknownSigner { index })
    }
}

impl ChainClient for RpcChainClient {
    type Pending = RpcPendingDeployment;

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let chain_id: String = self.call("eth_chainId", vec![]).await?;
        rpc::parse_quantity(&chain_id).map_err(rpc_error)
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<Self::Pending, ChainError> {
        let from = self.signer_address(request.signer).await?;

        let tx_hash: TxHash = self
            .call(
                "eth_sendTransaction",
                vec![serde_json::json!({
                    "from": from,
                    "data": request.data,
                })],
            )
            .await?;

        tracing::debug!(
            spec = %request.name,
            contract = %request.contract,
            %from,
            %tx_hash,
            "Creation transaction sent"
        );

        Ok(RpcPendingDeployment {
            client: self.client.clone(),
            url: self.url.to_string(),
            tx_hash,
            poll_interval: self.poll_interval,
        })
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        fetch_receipt(&self.client, self.url.as_str(), tx_hash)
            .await
            .map_err(rpc_error)?
            .map(|receipt| receipt.into_receipt(tx_hash))
            .transpose()
    }
}

/// Creation transaction submitted through [`RpcChainClient`].
#[derive(Debug)]
pub struct RpcPendingDeployment {
    client: reqwest::Client,
    url: String,
    tx_hash: TxHash,
    poll_interval: Duration,
}

impl PendingDeployment for RpcPendingDeployment {
    fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    async fn await_receipt(self) -> Result<Receipt, ChainError> {
        loop {
            // Transient transport errors should not fail a deployment that is
            // already on its way.
            let receipt = (|| fetch_receipt(&self.client, &self.url, self.tx_hash))
                .retry(ExponentialBuilder::default().with_max_times(5))
                .notify(|err, dur| {
                    tracing::debug!(
                        tx_hash = %self.tx_hash,
                        error = %err,
                        retry_in = ?dur,
                        "Receipt poll failed, retrying..."
                    );
                })
                .await
                .map_err(rpc_error)?;

            if let Some(receipt) = receipt {
                return receipt.into_receipt(self.tx_hash);
            }

            tracing::trace!(tx_hash = %self.tx_hash, "Receipt not available yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
