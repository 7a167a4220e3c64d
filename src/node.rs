/// Bitcoin Node Interface
///
/// Seam to the local node: transaction push, RPC fallback, fee estimation
/// and reachability. The engine authenticates with explicit credentials or
/// the node's cookie file. Tests substitute a mocked implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ArmoryConfig;
use crate::error::BroadcastError;
use crate::notifications::{ChainSyncState, NodeStatusInfo, Notification, NotificationBus};
use crate::organizer::ChainStatus;
use crate::sessions::SessionRegistry;
use crate::types::TxHash;

pub trait NodeInterface: Send + Sync {
    /// Push a transaction through the peer network.
    fn push_tx(&self, raw: &[u8]) -> Result<(), BroadcastError>;

    /// Whether the node has echoed the transaction back (it reached the
    /// node's mempool).
    fn has_seen_tx(&self, txid: &TxHash) -> bool;

    /// RPC fallback push.
    fn send_raw_tx_rpc(&self, raw: &[u8]) -> Result<(), BroadcastError>;

    /// Feerate for confirmation within `n_blocks`, in sat/kvB.
    fn estimate_fee(&self, n_blocks: u32, conservative: bool) -> Result<u64, BroadcastError>;

    fn node_connected(&self) -> bool;

    fn rpc_connected(&self) -> bool;

    /// The node's reported chain height, when reachable.
    fn chain_height(&self) -> Option<u32>;
}

/// JSON-RPC client against the local node. The peer-network interface is
/// external; pushes through this implementation report `PeerUnreachable`
/// so the broadcast path falls straight through to RPC.
pub struct RpcNode {
    url: String,
    config: Arc<ArmoryConfig>,
    client: reqwest::blocking::Client,
    request_id: AtomicU64,
}

impl RpcNode {
    pub fn new(config: Arc<ArmoryConfig>) -> Self {
        let url = format!("http://127.0.0.1:{}", config.rpc_port);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            url,
            config,
            client,
            request_id: AtomicU64::new(1),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, BroadcastError> {
        let (user, pass) = self
            .config
            .node_auth
            .resolve()
            .map_err(|_| BroadcastError::RpcUnreachable)?;
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .basic_auth(user, Some(pass))
            .json(&body)
            .send()
            .map_err(|e| {
                debug!(error = %e, method, "rpc transport failure");
                BroadcastError::RpcUnreachable
            })?;

        let payload: Value = response
            .json()
            .map_err(|_| BroadcastError::RpcUnreachable)?;
        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(BroadcastError::RpcRejected(error.to_string()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl NodeInterface for RpcNode {
    fn push_tx(&self, _raw: &[u8]) -> Result<(), BroadcastError> {
        // The p2p socket lives outside this process; callers fall back to
        // the RPC path.
        Err(BroadcastError::PeerUnreachable)
    }

    fn has_seen_tx(&self, txid: &TxHash) -> bool {
        let hex_id: String = txid.iter().rev().map(|b| format!("{:02x}", b)).collect();
        self.call("getmempoolentry", json!([hex_id])).is_ok()
    }

    fn send_raw_tx_rpc(&self, raw: &[u8]) -> Result<(), BroadcastError> {
        self.call("sendrawtransaction", json!([hex::encode(raw)]))
            .map(|_| ())
    }

    fn estimate_fee(&self, n_blocks: u32, conservative: bool) -> Result<u64, BroadcastError> {
        let mode = if conservative { "CONSERVATIVE" } else { "ECONOMICAL" };
        let result = self.call("estimatesmartfee", json!([n_blocks, mode]))?;
        let btc_per_kvb = result
            .get("feerate")
            .and_then(|f| f.as_f64())
            .ok_or_else(|| BroadcastError::RpcRejected("no feerate in estimate".into()))?;
        Ok((btc_per_kvb * 100_000_000.0) as u64)
    }

    fn node_connected(&self) -> bool {
        self.rpc_connected()
    }

    fn rpc_connected(&self) -> bool {
        self.call("getblockcount", json!([])).is_ok()
    }

    fn chain_height(&self) -> Option<u32> {
        self.call("getblockcount", json!([]))
            .ok()
            .and_then(|v| v.as_u64())
            .map(|h| h as u32)
    }
}

/// Current status snapshot for the NodeStatus request and notification.
pub fn node_status(node: &dyn NodeInterface, chain: &ChainStatus) -> NodeStatusInfo {
    let node_connected = node.node_connected();
    let rpc_connected = node.rpc_connected();
    let our_top = chain.top();
    let (chain_state, progress_pct, blocks_left) = match node.chain_height() {
        Some(node_top) if chain.is_ready() && our_top >= node_top => {
            (ChainSyncState::Ready, 100.0, 0)
        }
        Some(node_top) => {
            let pct = if node_top == 0 {
                0.0
            } else {
                (our_top as f32 / node_top as f32) * 100.0
            };
            (ChainSyncState::Syncing, pct, node_top.saturating_sub(our_top))
        }
        None => (ChainSyncState::Unknown, 0.0, 0),
    };
    NodeStatusInfo {
        node_connected,
        rpc_connected,
        chain_state,
        progress_pct,
        blocks_left,
    }
}

/// Poll the node and publish `NodeStatus` on every transition. Blocking;
/// runs on its own thread.
pub fn run_status_monitor(
    node: Arc<dyn NodeInterface>,
    chain: Arc<ChainStatus>,
    sessions: Arc<SessionRegistry>,
    bus: Arc<NotificationBus>,
    interval: Duration,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) {
    info!("node status monitor running");
    let mut last: Option<NodeStatusInfo> = None;
    while !shutdown.load(Ordering::Acquire) {
        let current = node_status(node.as_ref(), &chain);
        if last.as_ref() != Some(&current) {
            if !current.rpc_connected {
                warn!("node rpc unreachable");
            }
            let notification = Notification::NodeStatus(current.clone());
            sessions.fan_out(&notification);
            bus.publish(notification);
            last = Some(current);
        }
        std::thread::sleep(interval);
    }
}
