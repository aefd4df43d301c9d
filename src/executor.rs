use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::tx::bundle_from_signed_txs;

/// JSON-RPC "internal error"; relays use it for overload, so it is worth a rebuild.
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAck {
    pub bundle_hash: Option<String>,
}

/// A block-builder relay accepting signed bundles for a target block.
#[async_trait]
pub trait Relay: Send + Sync {
    fn id(&self) -> &str;

    async fn submit(&self, txs: &[Vec<u8>], target_block: u64) -> Result<RelayAck, RelayError>;
}

/// Relay client speaking Flashbots-style `eth_sendBundle`.
pub struct RelayClient {
    id: String,
    client: Client,
    relay_url: String,
}

impl RelayClient {
    pub fn new(id: impl Into<String>, relay_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().context("failed to build relay http client")?;
        Ok(Self { id: id.into(), client, relay_url: relay_url.into() })
    }

    pub fn from_config(cfg: &RelayConfig, timeout: Duration) -> Result<Self> {
        Self::new(cfg.id.clone(), cfg.url.clone(), timeout)
    }

    fn classify_body(&self, v: &serde_json::Value) -> Result<RelayAck, RelayError> {
        if let Some(err) = v.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or_default();
            let message = err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown relay error").to_string();
            return Err(if code == INTERNAL_ERROR {
                RelayError::Transient(message)
            } else {
                RelayError::Rejected(message)
            });
        }
        let result = v
            .get("result")
            .ok_or_else(|| RelayError::Transient("relay response has neither result nor error".to_string()))?;
        let bundle_hash = result
            .get("bundleHash")
            .and_then(|h| h.as_str())
            .or_else(|| result.as_str())
            .map(str::to_string);
        Ok(RelayAck { bundle_hash })
    }
}

#[async_trait]
impl Relay for RelayClient {
    fn id(&self) -> &str {
        &self.id
    }

    /// Submit a bundle (array of signed raw tx hex strings) for `target_block`.
    async fn submit(&self, txs: &[Vec<u8>], target_block: u64) -> Result<RelayAck, RelayError> {
        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendBundle",
            "params": [{
                "txs": bundle_from_signed_txs(txs),
                "blockNumber": format!("0x{:x}", target_block),
            }]
        });

        let resp = self
            .client
            .post(&self.relay_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("relay post failed: {e}")))?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RelayError::Transient(format!("relay returned {status}")));
        }
        let text = resp.text().await.map_err(|e| RelayError::Transient(format!("relay body read failed: {e}")))?;
        if !status.is_success() {
            return Err(RelayError::Rejected(format!("relay returned {status}: {text}")));
        }
        let v: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| RelayError::Transient(format!("invalid json response from relay: {e}")))?;
        self.classify_body(&v)
    }
}
