//! Bitcoin-Core-style JSON-RPC client implementing [`NodeClient`].
//!
//! Uses `getblock` at verbosity 2 so block fetches include decoded
//! transactions in one round trip. Values arrive in BTC and are converted
//! to satoshis; both the modern `address` field and the legacy `addresses`
//! array are accepted on outputs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use custodia_core::error::NodeError;
use custodia_core::traits::NodeClient;
use custodia_core::types::{BlockHash, BlockHeaderInfo, BlockInfo, TxInfo, TxInput, TxOutput, Txid};

/// Bitcoin Core's RPC_INVALID_ADDRESS_OR_KEY: the hash/height does not
/// name a known object.
const RPC_NOT_FOUND: i64 = -5;
/// RPC_INVALID_PARAMETER: used by `getblockhash` for out-of-range heights.
const RPC_INVALID_PARAMETER: i64 = -8;

/// Connection settings for [`RpcClient`].
#[derive(Clone, Debug)]
pub struct RpcClientConfig {
    /// Endpoint URL, e.g. `http://127.0.0.1:8332`.
    pub url: String,
    /// Basic-auth credentials, when the node requires them.
    pub auth: Option<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            auth: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC client for a Bitcoin-Core-style node.
pub struct RpcClient {
    http: reqwest::Client,
    config: RpcClientConfig,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize, Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    /// Create a client for the given endpoint.
    pub fn new(config: RpcClientConfig) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        Ok(Self { http, config, next_id: AtomicU64::new(0) })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, NodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "rpc call");

        let mut request = self.http.post(&self.config.url).json(&body);
        if let Some((user, pass)) = &self.config.auth {
            request = request.basic_auth(user, Some(pass));
        }

        // The node returns RPC errors with non-2xx statuses and a JSON
        // body; parse the body before judging the status.
        let response = request
            .send()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let status = response.status();
        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| NodeError::Transport(format!("status {status}: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(map_rpc_error(method, err));
        }
        parsed
            .result
            .ok_or_else(|| NodeError::InvalidResponse(format!("{method}: missing result")))
    }
}

fn map_rpc_error(method: &str, err: RpcError) -> NodeError {
    match err.code {
        RPC_NOT_FOUND | RPC_INVALID_PARAMETER => {
            NodeError::NotFound(format!("{method}: {}", err.message))
        }
        code => NodeError::InvalidResponse(format!("{method}: rpc error {code}: {}", err.message)),
    }
}

/// Convert a BTC amount to satoshis, rounding to the nearest unit.
fn btc_to_sats(btc: f64) -> u64 {
    (btc * 1e8).round() as u64
}

// --- Wire DTOs ---

#[derive(Deserialize)]
struct WireHeader {
    hash: BlockHash,
    height: u64,
    confirmations: i64,
    #[serde(rename = "previousblockhash")]
    previous_block_hash: Option<BlockHash>,
    #[serde(rename = "nextblockhash")]
    next_block_hash: Option<BlockHash>,
}

#[derive(Deserialize)]
struct WireBlock {
    hash: BlockHash,
    height: u64,
    confirmations: i64,
    #[serde(rename = "previousblockhash")]
    previous_block_hash: Option<BlockHash>,
    #[serde(rename = "nextblockhash")]
    next_block_hash: Option<BlockHash>,
    tx: Vec<WireTx>,
}

#[derive(Deserialize)]
struct WireTx {
    txid: Txid,
    vin: Vec<WireVin>,
    vout: Vec<WireVout>,
}

#[derive(Deserialize)]
struct WireVin {
    /// Present on coinbase inputs only.
    coinbase: Option<String>,
    txid: Option<Txid>,
    vout: Option<u32>,
}

#[derive(Deserialize)]
struct WireVout {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: WireScriptPubKey,
}

#[derive(Deserialize)]
struct WireScriptPubKey {
    #[serde(rename = "type")]
    script_type: String,
    /// Modern single-address form.
    address: Option<String>,
    /// Legacy multi-address form.
    addresses: Option<Vec<String>>,
}

impl From<WireHeader> for BlockHeaderInfo {
    fn from(w: WireHeader) -> Self {
        Self {
            hash: w.hash,
            height: w.height,
            confirmations: w.confirmations,
            previous_block_hash: w.previous_block_hash,
            next_block_hash: w.next_block_hash,
        }
    }
}

impl From<WireBlock> for BlockInfo {
    fn from(w: WireBlock) -> Self {
        Self {
            hash: w.hash,
            height: w.height,
            confirmations: w.confirmations,
            previous_block_hash: w.previous_block_hash,
            next_block_hash: w.next_block_hash,
            transactions: w.tx.into_iter().map(TxInfo::from).collect(),
        }
    }
}

impl From<WireTx> for TxInfo {
    fn from(w: WireTx) -> Self {
        Self {
            txid: w.txid,
            inputs: w.vin.into_iter().map(TxInput::from).collect(),
            outputs: w.vout.into_iter().map(TxOutput::from).collect(),
        }
    }
}

impl From<WireVin> for TxInput {
    fn from(w: WireVin) -> Self {
        if w.coinbase.is_some() {
            return Self { prev_txid: None, prev_vout: 0 };
        }
        Self { prev_txid: w.txid, prev_vout: w.vout.unwrap_or(0) }
    }
}

impl From<WireVout> for TxOutput {
    fn from(w: WireVout) -> Self {
        let addresses = match (w.script_pub_key.address, w.script_pub_key.addresses) {
            (Some(addr), _) => vec![addr],
            (None, Some(addrs)) => addrs,
            (None, None) => Vec::new(),
        };
        Self {
            value: btc_to_sats(w.value),
            script_type: w.script_pub_key.script_type,
            addresses,
        }
    }
}

#[async_trait]
impl NodeClient for RpcClient {
    async fn block(&self, hash: &BlockHash) -> Result<BlockInfo, NodeError> {
        let wire: WireBlock = self
            .call("getblock", json!([hash.to_string(), 2]))
            .await?;
        Ok(wire.into())
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, NodeError> {
        let wire: WireHeader = self
            .call("getblockheader", json!([hash.to_string(), true]))
            .await?;
        Ok(wire.into())
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, NodeError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn block_count(&self) -> Result<u64, NodeError> {
        self.call("getblockcount", json!([])).await
    }

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError> {
        self.call("getbestblockhash", json!([])).await
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<TxInfo, NodeError> {
        let wire: WireTx = self
            .call("getrawtransaction", json!([txid.to_string(), true]))
            .await?;
        Ok(wire.into())
    }
}
