//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Error object of a JSON-RPC response.
///
/// Kept typed inside the returned `anyhow::Error` so callers can tell a node-side
/// rejection from a transport failure with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}{}", data.as_ref().map(|d| format!(" (data: {d})")).unwrap_or_default())]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Send a JSON-RPC request and deserialize its `result`.
///
/// A `null` result deserializes into `None` when `T` is an `Option`. An error
/// response is returned as a [`JsonRpcError`].
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let body: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    let result = extract_result(body).with_context(|| format!("{} failed", method))?;
    serde_json::from_value(result)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Take the `result` out of a response body, or its `error` as a [`JsonRpcError`].
fn extract_result(mut body: Value) -> Result<Value, anyhow::Error> {
    if let Some(error) = body
        .get_mut("error")
        .filter(|error| !error.is_null())
        .map(Value::take)
    {
        let error = serde_json::from_value::<JsonRpcError>(error.clone()).unwrap_or_else(|_| {
            JsonRpcError {
                code: 0,
                message: error.to_string(),
                data: None,
            }
        });
        return Err(error.into());
    }

    body.get_mut("result")
        .map(Value::take)
        .context("No result in response")
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64, anyhow::Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity: {}", value))
}
