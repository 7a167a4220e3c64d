/// Broadcast Manager
///
/// Every externally initiated push gets a 6-byte random broadcast id so
/// downstream notifications can be correlated by the originating client.
/// Peer pushes that the node never echoes back fall through to the RPC
/// path after a bounded wait; an RPC failure surfaces as an asynchronous
/// Error notification tagged with the id. Broadcast never blocks for
/// inclusion; everything past admission is fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::ledger::{LedgerEntry, LedgerFlags, ZcLedgerInfo};
use crate::node::NodeInterface;
use crate::notifications::{Notification, NotificationBus};
use crate::sessions::{Session, SessionRegistry};
use crate::types::{unix_now, BroadcastId, TxHash};
use crate::wire::error_code;
use crate::zeroconf::{Admitted, Evicted, ZcEngine};

pub fn new_broadcast_id() -> BroadcastId {
    let mut id = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Ledger entry for a zc notification: the net movement over every
/// scripthash the transaction touches.
pub fn zc_ledger_entry(info: &ZcLedgerInfo) -> LedgerEntry {
    LedgerEntry {
        tx_hash: info.txid,
        value: info.deltas.values().sum(),
        height: None,
        tx_index: 0,
        zc_index: Some(info.zc_index),
        flags: LedgerFlags {
            is_rbf: info.rbf,
            is_chained_zc: info.chained,
            has_witness: info.witness,
            ..Default::default()
        },
    }
}

pub struct BroadcastManager {
    zc: Arc<ZcEngine>,
    sessions: Arc<SessionRegistry>,
    bus: Arc<NotificationBus>,
    node: Arc<dyn NodeInterface>,
    timeout: Duration,
}

impl BroadcastManager {
    pub fn new(
        zc: Arc<ZcEngine>,
        sessions: Arc<SessionRegistry>,
        bus: Arc<NotificationBus>,
        node: Arc<dyn NodeInterface>,
        timeout: Duration,
    ) -> Self {
        Self {
            zc,
            sessions,
            bus,
            node,
            timeout,
        }
    }

    fn publish(&self, notification: Notification) {
        self.sessions.fan_out(&notification);
        self.bus.publish(notification);
    }

    fn publish_evictions(&self, evicted: &[Evicted]) {
        for eviction in evicted {
            self.publish(Notification::InvalidatedZc {
                tx_hashes: vec![eviction.txid],
                broadcast_id: eviction.broadcast_id,
            });
        }
    }

    fn error_to(&self, session: &Arc<Session>, id: BroadcastId, error: &EngineError) {
        session.push(Notification::Error {
            code: error_code(error),
            message: error.to_string(),
            data: None,
            broadcast_id: Some(id),
        });
    }

    /// Admit and push a batch of raw transactions. The id returns
    /// immediately; admission results and push failures arrive as
    /// notifications.
    pub async fn broadcast_zc(&self, session: &Arc<Session>, raw_txs: Vec<Vec<u8>>) -> BroadcastId {
        let id = new_broadcast_id();
        for raw in raw_txs {
            match self.zc.admit(&raw, Some(id), unix_now()) {
                Ok(Admitted::Fresh {
                    txid,
                    touched,
                    evicted,
                    ..
                }) => {
                    self.publish_evictions(&evicted);
                    if let Some(info) = self.zc.ledger_info_of(&txid) {
                        self.publish(Notification::Zc {
                            entries: vec![zc_ledger_entry(&info)],
                            scripthashes: touched,
                            broadcast_id: Some(id),
                        });
                    }
                    self.push_to_network(session.clone(), id, txid, raw).await;
                }
                Ok(Admitted::Duplicate { txid, touched, .. }) => {
                    // Re-announce the resident transaction under the new id.
                    debug!(txid = %crate::types::DisplayHash(&txid), "rebroadcast of resident zc");
                    if let Some(info) = self.zc.ledger_info_of(&txid) {
                        self.publish(Notification::Zc {
                            entries: vec![zc_ledger_entry(&info)],
                            scripthashes: touched,
                            broadcast_id: Some(id),
                        });
                    }
                }
                Err(error) => {
                    self.error_to(session, id, &error);
                }
            }
        }
        id
    }

    /// Push one transaction straight through the RPC interface.
    pub async fn broadcast_rpc(&self, session: &Arc<Session>, raw_tx: Vec<u8>) -> BroadcastId {
        let id = new_broadcast_id();
        match self.zc.admit(&raw_tx, Some(id), unix_now()) {
            Ok(Admitted::Fresh {
                txid,
                touched,
                evicted,
                ..
            }) => {
                self.publish_evictions(&evicted);
                if let Some(info) = self.zc.ledger_info_of(&txid) {
                    self.publish(Notification::Zc {
                        entries: vec![zc_ledger_entry(&info)],
                        scripthashes: touched,
                        broadcast_id: Some(id),
                    });
                }
                self.rpc_push(session.clone(), id, raw_tx).await;
            }
            Ok(Admitted::Duplicate { txid, touched, .. }) => {
                if let Some(info) = self.zc.ledger_info_of(&txid) {
                    self.publish(Notification::Zc {
                        entries: vec![zc_ledger_entry(&info)],
                        scripthashes: touched,
                        broadcast_id: Some(id),
                    });
                }
                self.rpc_push(session.clone(), id, raw_tx).await;
            }
            Err(error) => self.error_to(session, id, &error),
        }
        id
    }

    async fn rpc_push(&self, session: Arc<Session>, id: BroadcastId, raw: Vec<u8>) {
        let node = self.node.clone();
        let result = tokio::task::spawn_blocking(move || node.send_raw_tx_rpc(&raw)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => self.error_to(&session, id, &error.into()),
            Err(join_error) => {
                debug!(error = %join_error, "rpc push task failed");
            }
        }
    }

    /// Peer push with bounded-echo fallback: if the node does not report
    /// the transaction within the window, push it over RPC instead.
    async fn push_to_network(
        &self,
        session: Arc<Session>,
        id: BroadcastId,
        txid: TxHash,
        raw: Vec<u8>,
    ) {
        let node = self.node.clone();
        let push_raw = raw.clone();
        let pushed = tokio::task::spawn_blocking(move || node.push_tx(&push_raw)).await;

        match pushed {
            Ok(Ok(())) => {
                // Watch for the echo; RPC fallback on timeout.
                let node = self.node.clone();
                let timeout = self.timeout;
                let fallback = FallbackHandle {
                    node: self.node.clone(),
                };
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let seen = {
                        let node = node.clone();
                        tokio::task::spawn_blocking(move || node.has_seen_tx(&txid))
                            .await
                            .unwrap_or(false)
                    };
                    if !seen {
                        info!(
                            txid = %crate::types::DisplayHash(&txid),
                            "peer push not echoed, falling back to rpc"
                        );
                        fallback.rpc_fallback(session, id, raw).await;
                    }
                });
            }
            Ok(Err(_peer_error)) => {
                // No peer path; go straight to RPC.
                self.rpc_push(session, id, raw).await;
            }
            Err(join_error) => {
                debug!(error = %join_error, "peer push task failed");
            }
        }
    }
}

/// Slim handle for detached timeout tasks.
struct FallbackHandle {
    node: Arc<dyn NodeInterface>,
}

impl FallbackHandle {
    async fn rpc_fallback(&self, session: Arc<Session>, id: BroadcastId, raw: Vec<u8>) {
        let node = self.node.clone();
        let result = tokio::task::spawn_blocking(move || node.send_raw_tx_rpc(&raw)).await;
        if let Ok(Err(error)) = result {
            let error: EngineError = error.into();
            session.push(Notification::Error {
                code: error_code(&error),
                message: error.to_string(),
                data: None,
                broadcast_id: Some(id),
            });
        }
    }
}
