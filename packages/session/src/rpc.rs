//! Ethereum JSON-RPC plumbing and the read-only provider.

use std::time::Duration;

use async_trait::async_trait;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, SessionError},
    types::Address,
};

/// Read access to a chain: the capability both the fallback endpoint and a
/// connected wallet provide.
#[async_trait]
pub trait ReadProvider: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    /// Native-currency balance in wei.
    async fn balance(&self, address: Address) -> Result<U256>;

    /// `eth_call` against `latest`; returns the raw return data.
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// JSON-RPC request wrapper.
#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// JSON-RPC response wrapper.
#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Minimal JSON-RPC 2.0 client over HTTP.
#[derive(Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
}

/// Upper bound for one HTTP round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform a raw JSON-RPC call. A `null` result is returned as `Value::Null`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let resp: RpcResponse = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("{} request failed: {}", method, e)))?
            .json()
            .await
            .map_err(|e| {
                SessionError::Transport(format!("failed to parse {} response: {}", method, e))
            })?;

        if let Some(err) = resp.error {
            return Err(SessionError::from_rpc(err.code, err.message));
        }

        Ok(resp.result.unwrap_or(Value::Null))
    }

    pub async fn eth_chain_id(&self) -> Result<u64> {
        let result = self.request("eth_chainId", serde_json::json!([])).await?;
        parse_hex_u64(expect_str(&result, "eth_chainId")?)
    }

    pub async fn eth_get_balance(&self, address: Address) -> Result<U256> {
        let result = self
            .request(
                "eth_getBalance",
                serde_json::json!([address.to_string(), "latest"]),
            )
            .await?;
        parse_hex_u256(expect_str(&result, "eth_getBalance")?)
    }

    pub async fn eth_call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>> {
        let result = self
            .request(
                "eth_call",
                serde_json::json!([
                    {"to": to.to_string(), "data": format!("0x{}", hex::encode(data))},
                    "latest"
                ]),
            )
            .await?;
        parse_hex_bytes(expect_str(&result, "eth_call")?)
    }
}

/// Read-only provider backed by a public JSON-RPC endpoint.
pub struct HttpRpc {
    client: JsonRpcClient,
}

impl HttpRpc {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }
}

#[async_trait]
impl ReadProvider for HttpRpc {
    async fn chain_id(&self) -> Result<u64> {
        self.client.eth_chain_id().await
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.client.eth_get_balance(address).await
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        self.client.eth_call(to, &data).await
    }
}

// ---------------------------------------------------------------------------
// Hex / quantity parsing helpers
// ---------------------------------------------------------------------------

pub(crate) fn expect_str<'a>(value: &'a Value, method: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| SessionError::Transport(format!("{}: expected a hex string", method)))
}

fn strip_hex(hex_str: &str) -> &str {
    hex_str
        .strip_prefix("0x")
        .or_else(|| hex_str.strip_prefix("0X"))
        .unwrap_or(hex_str)
}

pub(crate) fn parse_hex_u64(hex_str: &str) -> Result<u64> {
    let stripped = strip_hex(hex_str);
    if stripped.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(stripped, 16)
        .map_err(|e| SessionError::Transport(format!("invalid hex quantity {}: {}", hex_str, e)))
}

pub(crate) fn parse_hex_u256(hex_str: &str) -> Result<U256> {
    let stripped = strip_hex(hex_str).trim_start_matches('0');
    if stripped.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(stripped, 16)
        .map_err(|e| SessionError::Transport(format!("invalid hex quantity {}: {:?}", hex_str, e)))
}

pub(crate) fn parse_hex_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let stripped = strip_hex(hex_str);
    if stripped.is_empty() {
        return Ok(Vec::new());
    }

    // Handle odd-length hex
    let padded = if stripped.len() % 2 == 1 {
        format!("0{}", stripped)
    } else {
        stripped.to_string()
    };

    hex::decode(&padded).map_err(|e| SessionError::Transport(format!("invalid hex data: {}", e)))
}

pub(crate) fn to_quantity(value: U256) -> String {
    format!("0x{:x}", value)
}
