/// Request Dispatcher
///
/// Decodes client requests, routes them to the engine components and
/// serializes replies. Notifications fan out through the session registry;
/// the dispatcher only ever touches the calling session's state. Node
/// calls block, so they run on the blocking pool.

use std::sync::Arc;

use tracing::debug;

use crate::broadcast::BroadcastManager;
use crate::config::ArmoryConfig;
use crate::error::{EngineError, InputError};
use crate::ledger;
use crate::node::{node_status, NodeInterface};
use crate::notifications::{Notification, NotificationBus};
use crate::organizer::ChainStatus;
use crate::queries::{delta_balances, QueryEngine, RawTxRecord};
use crate::sessions::{Session, SessionRegistry};
use crate::types::{ScriptHash, TxHash};
use crate::wire::{
    error_reply, FeeEstimateMode, HistoryView, Reply, Request, WalletBalances, WalletTxnCounts,
};
use crate::zeroconf::ZcEngine;

/// Everything a connection handler needs, bundled once at startup.
pub struct EngineHandles {
    pub config: Arc<ArmoryConfig>,
    pub queries: Arc<QueryEngine>,
    pub zc: Arc<ZcEngine>,
    pub sessions: Arc<SessionRegistry>,
    pub bus: Arc<NotificationBus>,
    pub broadcaster: Arc<BroadcastManager>,
    pub node: Arc<dyn NodeInterface>,
    pub chain: Arc<ChainStatus>,
}

pub struct Dispatcher {
    pub handles: Arc<EngineHandles>,
}

impl Dispatcher {
    pub fn new(handles: Arc<EngineHandles>) -> Self {
        Self { handles }
    }

    fn resolve_view(
        &self,
        session: &Arc<Session>,
        view: &HistoryView,
    ) -> Result<Vec<ScriptHash>, EngineError> {
        match view {
            HistoryView::Wallet(id) => session
                .wallet_scripthashes(id)
                .ok_or_else(|| InputError::UnknownWallet(id.clone()).into()),
            HistoryView::All => Ok(session.all_scripthashes()),
            HistoryView::Address(scripthash) => {
                if scripthash.is_empty() {
                    Err(InputError::UnknownScripthash.into())
                } else {
                    Ok(vec![scripthash.clone()])
                }
            }
        }
    }

    fn view_key(view: &HistoryView) -> String {
        match view {
            HistoryView::Wallet(id) => id.clone(),
            HistoryView::All => String::new(),
            HistoryView::Address(scripthash) => hex::encode(scripthash),
        }
    }

    fn hash32(bytes: &[u8]) -> Result<TxHash, EngineError> {
        if bytes.len() != 32 {
            return Err(InputError::MalformedRequest(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            ))
            .into());
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    pub async fn handle(&self, session: &Arc<Session>, request: Request) -> Reply {
        match self.dispatch(session, request).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!(session = session.id, error = %error, "request failed");
                error_reply(&error)
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        request: Request,
    ) -> Result<Reply, EngineError> {
        let h = &self.handles;
        match request {
            Request::Register {
                wallet_id,
                scripthashes,
                is_new,
            } => {
                if !is_new {
                    // Existing addresses: their subssh ranges are read
                    // before the ack so history is warm by Refresh time.
                    for scripthash in &scripthashes {
                        let _ = h.queries.ssh(scripthash)?;
                    }
                }
                // Refresh sits in the queue before the observer map makes
                // the session visible to zc fan-out.
                session.push(Notification::Refresh {
                    ids: vec![wallet_id.clone()],
                });
                h.sessions.register_wallet(session, &wallet_id, scripthashes);
                Ok(Reply::Registered {
                    refresh_id: wallet_id,
                })
            }

            Request::Unregister {
                wallet_id,
                scripthashes,
            } => {
                if let Some(id) = wallet_id {
                    h.sessions.unregister_wallet(session, &id);
                }
                if !scripthashes.is_empty() {
                    h.sessions.unregister_scripthashes(session, &scripthashes);
                }
                Ok(Reply::Unregistered)
            }

            Request::GoOnline => {
                session.set_online();
                if h.chain.is_ready() {
                    session.push(Notification::Ready {
                        top_height: h.chain.top(),
                    });
                }
                Ok(Reply::GoingOnline)
            }

            Request::HistoryPage { view, page } => {
                let scripthashes = self.resolve_view(session, &view)?;
                let overlay = h.zc.ledger_overlay(&scripthashes);
                let entries =
                    ledger::history_page(h.queries.store(), &scripthashes, &overlay, page)?;
                session.set_cursor(&Self::view_key(&view), page);
                Ok(Reply::HistoryPage { entries })
            }

            Request::GetCombinedBalances { wallet_ids } => {
                let last_seen = session.last_seen_snapshot();
                let mut wallets = Vec::with_capacity(wallet_ids.len());
                for wallet_id in wallet_ids {
                    let scripthashes = session
                        .wallet_scripthashes(&wallet_id)
                        .ok_or_else(|| InputError::UnknownWallet(wallet_id.clone()))?;
                    let zc_deltas = h.zc.deltas_for(&scripthashes);
                    let (rollup, changed) =
                        delta_balances(&h.queries, &scripthashes, &last_seen, &zc_deltas)?;
                    for (scripthash, _, version) in &changed {
                        session.mark_seen(scripthash, *version);
                    }
                    wallets.push(WalletBalances {
                        wallet_id,
                        rollup,
                        addresses: changed,
                    });
                }
                Ok(Reply::CombinedBalances { wallets })
            }

            Request::GetCombinedTxnCounts { wallet_ids } => {
                let last_seen = session.last_seen_snapshot();
                let mut wallets = Vec::with_capacity(wallet_ids.len());
                for wallet_id in wallet_ids {
                    let scripthashes = session
                        .wallet_scripthashes(&wallet_id)
                        .ok_or_else(|| InputError::UnknownWallet(wallet_id.clone()))?;
                    let mut total = 0u64;
                    let mut addresses = Vec::new();
                    for scripthash in &scripthashes {
                        let ssh = h.queries.ssh(scripthash)?;
                        total += ssh.txio_count;
                        let seen = last_seen.get(scripthash).copied().unwrap_or(0);
                        if ssh.version > seen {
                            session.mark_seen(scripthash, ssh.version);
                            addresses.push((scripthash.clone(), ssh.txio_count, ssh.version));
                        }
                    }
                    wallets.push(WalletTxnCounts {
                        wallet_id,
                        total,
                        addresses,
                    });
                }
                Ok(Reply::CombinedTxnCounts { wallets })
            }

            Request::GetUtxos { view, min_value } => {
                let scripthashes = self.resolve_view(session, &view)?;
                let utxos = h.queries.utxos(&scripthashes, min_value)?;
                Ok(Reply::Utxos { utxos })
            }

            Request::GetOutpointsForAddresses {
                scripthashes,
                height_cutoff,
                zc_cutoff,
            } => {
                let mut batch = h
                    .queries
                    .outpoints_for_addresses(&scripthashes, height_cutoff)?;
                for (scripthash, zc_records) in h.zc.outpoints_for(&scripthashes, zc_cutoff) {
                    if zc_records.is_empty() {
                        continue;
                    }
                    match batch
                        .per_scripthash
                        .iter_mut()
                        .find(|(sh, _)| *sh == scripthash)
                    {
                        Some((_, records)) => records.extend(zc_records),
                        None => batch.per_scripthash.push((scripthash, zc_records)),
                    }
                }
                batch.next_zc_cutoff = h.zc.top_index();
                Ok(Reply::Outpoints(batch))
            }

            Request::GetSpentness { outpoints } => {
                let results = h.queries.spentness(&outpoints)?;
                Ok(Reply::Spentness { results })
            }

            Request::GetZcSpentness { outpoints } => {
                let results = h.zc.zc_spentness(&outpoints)?;
                Ok(Reply::ZcSpentness { results })
            }

            Request::GetTxByHash { hash } => {
                let txid = Self::hash32(&hash)?;
                let tx = self.lookup_tx(&txid)?;
                Ok(Reply::Tx { tx })
            }

            Request::GetTxBatchByHash { hashes } => {
                let mut txs = Vec::with_capacity(hashes.len());
                for hash in &hashes {
                    let txid = Self::hash32(hash)?;
                    txs.push((txid, self.lookup_tx(&txid)?));
                }
                Ok(Reply::TxBatch { txs })
            }

            Request::GetHeaderByHash { hash } => {
                let block_hash = Self::hash32(&hash)?;
                let header = h.queries.header_by_hash(&block_hash)?;
                Ok(Reply::Header {
                    height: header.as_ref().map(|r| r.height),
                    raw_header: header.map(|r| r.raw_header),
                })
            }

            Request::GetHeaderByHeight { height } => {
                let header = h.queries.header_by_height(height)?;
                Ok(Reply::Header {
                    height: header.as_ref().map(|r| r.height),
                    raw_header: header.map(|r| r.raw_header),
                })
            }

            Request::BroadcastZc { raw_txs } => {
                let broadcast_id = h.broadcaster.broadcast_zc(session, raw_txs).await;
                Ok(Reply::Broadcast { broadcast_id })
            }

            Request::BroadcastThroughRpc { raw_tx } => {
                let broadcast_id = h.broadcaster.broadcast_rpc(session, raw_tx).await;
                Ok(Reply::Broadcast { broadcast_id })
            }

            Request::NodeStatus => {
                let node = h.node.clone();
                let chain = h.chain.clone();
                let status =
                    tokio::task::spawn_blocking(move || node_status(node.as_ref(), &chain))
                        .await
                        .map_err(|e| {
                            EngineError::Chain(crate::error::ChainError::StoreIO(e.to_string()))
                        })?;
                Ok(Reply::NodeStatus(status))
            }

            Request::EstimateFee { n_blocks, mode } => {
                let node = h.node.clone();
                let conservative = mode == FeeEstimateMode::Conservative;
                let feerate = tokio::task::spawn_blocking(move || {
                    node.estimate_fee(n_blocks, conservative)
                })
                .await
                .map_err(|e| EngineError::Chain(crate::error::ChainError::StoreIO(e.to_string())))??;
                Ok(Reply::FeeEstimate {
                    feerate_sat_per_kb: feerate,
                    blocks: n_blocks,
                })
            }

            Request::FeeSchedule { mode } => {
                let node = h.node.clone();
                let conservative = mode == FeeEstimateMode::Conservative;
                let entries = tokio::task::spawn_blocking(move || {
                    let targets = [2u32, 4, 6, 12, 24];
                    let mut entries = Vec::with_capacity(targets.len());
                    for target in targets {
                        match node.estimate_fee(target, conservative) {
                            Ok(feerate) => entries.push((target, feerate)),
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(entries)
                })
                .await
                .map_err(|e| EngineError::Chain(crate::error::ChainError::StoreIO(e.to_string())))??;
                Ok(Reply::FeeSchedule { entries })
            }
        }
    }

    /// Confirmed store first, zc store second. Unconfirmed hits report the
    /// sentinel height.
    fn lookup_tx(&self, txid: &TxHash) -> Result<Option<RawTxRecord>, EngineError> {
        if let Some(record) = self.handles.queries.tx_by_hash(txid)? {
            return Ok(Some(record));
        }
        Ok(self.handles.zc.raw_tx(txid).map(|raw| RawTxRecord {
            raw,
            height: u32::MAX,
            tx_index: 0,
        }))
    }
}
