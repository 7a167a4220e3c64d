/// Notification Bus
///
/// Engine-wide event types pushed to subscribed sessions. The bus is a
/// broadcast channel; the session registry filters and fans events into
/// per-session outbound queues.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ledger::LedgerEntry;
use crate::types::{BroadcastId, ScriptHash, TxHash};

/// Long-scan phases reported through `Progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    DbHeaders,
    OrganizingChain,
    BlockHeaders,
    BlockData,
    Rescan,
    Balance,
    SearchHashes,
    ResolveHashes,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSyncState {
    Unknown,
    Syncing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub node_connected: bool,
    pub rpc_connected: bool,
    pub chain_state: ChainSyncState,
    pub progress_pct: f32,
    pub blocks_left: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// Initial scan complete. Emitted once; reorgs do not repeat it.
    Ready { top_height: u32 },
    NewBlock {
        top_height: u32,
        /// Branching height when the new top arrived through a reorg.
        branch_point: Option<u32>,
    },
    /// Registration ack or rescan completion for the listed wallet ids.
    Refresh { ids: Vec<String> },
    Zc {
        entries: Vec<LedgerEntry>,
        scripthashes: Vec<ScriptHash>,
        broadcast_id: Option<BroadcastId>,
    },
    InvalidatedZc {
        tx_hashes: Vec<TxHash>,
        broadcast_id: Option<BroadcastId>,
    },
    NodeStatus(NodeStatusInfo),
    Progress {
        phase: ScanPhase,
        progress_pct: f32,
        eta_secs: u64,
        wallet_ids: Vec<String>,
    },
    Error {
        code: u32,
        message: String,
        data: Option<Vec<u8>>,
        broadcast_id: Option<BroadcastId>,
    },
}

impl Notification {
    /// Scripthashes this event is scoped to; None means every session
    /// receives it.
    pub fn touched(&self) -> Option<&[ScriptHash]> {
        match self {
            Notification::Zc { scripthashes, .. } => Some(scripthashes),
            _ => None,
        }
    }
}

/// Broadcast fan-in point between the engine threads and the session layer.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to whoever listens; lagging receivers observe a gap, never a
    /// block.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
