pub mod poller;

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::RpcConfig;

const METHOD_BLOCK_NUMBER: &str = "eth_blockNumber";
const METHOD_GET_BLOCK: &str = "eth_getBlockByNumber";

/// One block as observed on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockData {
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Raw block timestamp. Seconds or nanoseconds depending on consensus.
    pub timestamp: u64,
    pub txn_count: usize,
}

impl fmt::Display for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block{{ number:{}, txns:{}, time:{}, gasLimit:{}, gasUsed:{}}}",
            self.number, self.txn_count, self.timestamp, self.gas_limit, self.gas_used
        )
    }
}

/// Errors returned by a chain reader.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The node could not be reached.
    #[error("{method} request failed: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The node answered with a non-success HTTP status.
    #[error("{method} request returned status {status}")]
    Status {
        method: &'static str,
        status: reqwest::StatusCode,
    },

    /// The JSON-RPC response carried an error object.
    #[error("{method} returned rpc error {code}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },

    /// The response body or one of its fields could not be decoded.
    #[error("decoding {what}: {reason}")]
    Decode { what: String, reason: String },

    /// The node has no data for the block yet.
    #[error("block {0} not found")]
    BlockNotFound(u64),
}

impl ChainError {
    /// Whether the caller may retry the same request later.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BlockNotFound(_))
    }
}

/// Callback type for recording RPC request metrics.
/// Receives (method, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Source of block heights and block metadata.
pub trait ChainReader: Send + Sync {
    /// Fetch the latest block height.
    fn current_height(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, ChainError>> + Send;

    /// Fetch a block by number.
    fn get_block(
        &self,
        number: u64,
    ) -> impl std::future::Future<Output = Result<BlockData, ChainError>> + Send;
}

/// JSON-RPC over HTTP chain reader.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new JSON-RPC client.
    pub fn new(cfg: &RpcConfig) -> anyhow::Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, method: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(method, status, duration);
        }
    }

    /// Perform one JSON-RPC call and decode its `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
        id: u64,
    ) -> Result<Option<T>, ChainError> {
        let start = Instant::now();
        let result = self.call_inner(method, params, id).await;

        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request(method, status, start.elapsed());

        result
    }

    async fn call_inner<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
        id: u64,
    ) -> Result<Option<T>, ChainError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|source| ChainError::Transport { method, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Status { method, status });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ChainError::Transport { method, source })?;

        let decoded: RpcResponse<T> =
            serde_json::from_slice(&bytes).map_err(|e| ChainError::Decode {
                what: format!("{method} response"),
                reason: e.to_string(),
            })?;

        if let Some(err) = decoded.error {
            if err.code != 0 || !err.message.is_empty() {
                return Err(ChainError::Rpc {
                    method,
                    code: err.code,
                    message: err.message,
                });
            }
        }

        Ok(decoded.result)
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    #[serde(default)]
    number: String,
    #[serde(default)]
    gas_limit: String,
    #[serde(default)]
    gas_used: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    transactions: Vec<serde_json::Value>,
}

impl ChainReader for Client {
    async fn current_height(&self) -> Result<u64, ChainError> {
        let result: Option<String> = self
            .call(METHOD_BLOCK_NUMBER, serde_json::json!([]), 1)
            .await?;

        let raw = result.unwrap_or_default();
        let height = parse_hex_u64(&raw, "block height")?;
        debug!(height, "fetched block height");

        Ok(height)
    }

    async fn get_block(&self, number: u64) -> Result<BlockData, ChainError> {
        let result: Option<RawBlock> = self
            .call(
                METHOD_GET_BLOCK,
                serde_json::json!([format!("0x{number:x}"), false]),
                2,
            )
            .await?;

        let raw = match result {
            Some(raw) if !raw.number.is_empty() => raw,
            _ => return Err(ChainError::BlockNotFound(number)),
        };

        let block = decode_block(raw)?;
        debug!(%block, "fetched block");

        Ok(block)
    }
}

fn decode_block(raw: RawBlock) -> Result<BlockData, ChainError> {
    Ok(BlockData {
        number: parse_hex_u64(&raw.number, "block number")?,
        gas_limit: parse_hex_u64(&raw.gas_limit, "gasLimit")?,
        gas_used: parse_hex_u64(&raw.gas_used, "gasUsed")?,
        timestamp: parse_hex_u64(&raw.timestamp, "timestamp")?,
        txn_count: raw.transactions.len(),
    })
}

/// Parse a quantity that is hex when `0x`-prefixed and decimal otherwise.
fn parse_hex_u64(s: &str, what: &str) -> Result<u64, ChainError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };

    parsed.map_err(|e| ChainError::Decode {
        what: what.to_string(),
        reason: format!("{s:?}: {e}"),
    })
}
