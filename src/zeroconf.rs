/// Zero-Confirmation Engine
///
/// In-memory acceptor and index of unconfirmed transactions. Tracks who
/// spends what, the zc-to-zc dependency DAG, and per-scripthash balance
/// deltas, and survives restarts through snapshots in the zeroconf column
/// family.
///
/// Admission is serialized: every mutating entry point takes the write
/// lock, and the engine assembly drives them from one thread. Queries take
/// the read lock and see a consistent snapshot.
///
/// Replacement policy: a conflicting spend replaces the resident zc iff the
/// resident signals replace-by-fee (nSequence < 0xFFFFFFFE on at least one
/// input) and the newcomer pays strictly more fee than everything it
/// evicts, descendants included.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use secp256k1::{Secp256k1, VerifyOnly};
use tracing::{debug, info, warn};

use crate::db::{
    decode, encode, OutpointRef, StoreHandles, StxoRecord, ZcPersistRecord, CF_STXO, CF_ZEROCONF,
};
use crate::error::{ChainError, EngineError, ZcError};
use crate::keys;
use crate::ledger::ZcLedgerInfo;
use crate::parser::{parse_tx_bytes, ParsedTx};
use crate::queries::OutpointRecord;
use crate::script::{scripthash_of, verify_input};
use crate::types::{BroadcastId, Outpoint, ScriptHash, TxHash};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ZcSpentness {
    Unspent,
    SpentByZc { spender: TxHash },
    Invalid,
}

#[derive(Debug, Clone)]
pub struct ZcEntry {
    pub tx: ParsedTx,
    pub arrival_time: u64,
    pub zc_index: u64,
    /// Resolved inputs: outpoint, value, producing scripthash.
    pub consumed: Vec<(Outpoint, u64, Option<ScriptHash>)>,
    pub touched: HashSet<ScriptHash>,
    pub deltas: HashMap<ScriptHash, i64>,
    /// Parents still unconfirmed at admission time.
    pub parents: HashSet<TxHash>,
    pub broadcast_id: Option<BroadcastId>,
    pub fee: u64,
}

impl ZcEntry {
    pub fn ledger_info(&self) -> ZcLedgerInfo {
        ZcLedgerInfo {
            txid: self.tx.txid,
            zc_index: self.zc_index,
            deltas: self.deltas.clone(),
            rbf: self.tx.signals_rbf(),
            chained: !self.parents.is_empty(),
            witness: self.tx.has_witness,
        }
    }
}

/// Result of a successful admission.
#[derive(Debug, Clone)]
pub enum Admitted {
    /// Newly admitted; carries evictions its replacement caused.
    Fresh {
        txid: TxHash,
        zc_index: u64,
        touched: Vec<ScriptHash>,
        evicted: Vec<Evicted>,
    },
    /// Already resident; re-announce under the caller's broadcast id.
    Duplicate {
        txid: TxHash,
        zc_index: u64,
        touched: Vec<ScriptHash>,
    },
}

#[derive(Debug, Clone)]
pub struct Evicted {
    pub txid: TxHash,
    pub broadcast_id: Option<BroadcastId>,
    pub touched: Vec<ScriptHash>,
    pub reason: ZcError,
}

/// What a committed block did to the zc store.
#[derive(Debug, Clone, Default)]
pub struct BlockSweep {
    /// Mined and therefore silently dropped.
    pub confirmed: Vec<TxHash>,
    /// Now conflicting with the chain; notified as invalidated.
    pub evicted: Vec<Evicted>,
}

#[derive(Default)]
struct ZcState {
    txs: HashMap<TxHash, ZcEntry>,
    /// outpoint -> zc spending it.
    spenders: HashMap<Outpoint, TxHash>,
    /// zc -> zcs spending its outputs.
    children: HashMap<TxHash, HashSet<TxHash>>,
    /// scripthash -> zcs touching it; drives notification fan-out.
    matcher: HashMap<ScriptHash, HashSet<TxHash>>,
    next_index: u64,
}

pub struct ZcEngine {
    state: RwLock<ZcState>,
    store: Arc<StoreHandles>,
    secp: Secp256k1<VerifyOnly>,
}

impl ZcEngine {
    pub fn new(store: Arc<StoreHandles>) -> Self {
        Self {
            state: RwLock::new(ZcState::default()),
            store,
            secp: Secp256k1::verification_only(),
        }
    }

    /// Reload persisted zc transactions after restart, oldest first.
    /// Entries that no longer validate against the chain are dropped.
    pub fn reload_from_store(&self) -> Result<usize, ChainError> {
        use rocksdb::IteratorMode;
        let cf = self.store.cf(CF_ZEROCONF)?;
        let mut snapshots: Vec<ZcPersistRecord> = Vec::new();
        for item in self.store.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(ChainError::from)?;
            if key.first() != Some(&b'Z') {
                continue;
            }
            snapshots.push(decode(&value)?);
        }
        snapshots.sort_by_key(|r| (r.arrival_time, r.zc_index));

        let mut reloaded = 0usize;
        for record in snapshots {
            match self.admit(&record.raw, record.broadcast_id, record.arrival_time) {
                Ok(_) => reloaded += 1,
                Err(e) => debug!(error = %e, "dropped stale zc snapshot on reload"),
            }
        }
        info!(reloaded, "reloaded zero-confirmation store");
        Ok(reloaded)
    }

    fn chain_stxo(&self, outpoint: &Outpoint) -> Result<Option<StxoRecord>, ChainError> {
        let Some(op_ref) = self
            .store
            .get_record::<OutpointRef>(CF_STXO, &keys::outpoint_key(&outpoint.txid, outpoint.index))?
        else {
            return Ok(None);
        };
        self.store.get_record(
            CF_STXO,
            &keys::stxo_key(op_ref.height, op_ref.tx_index, outpoint.index as u16),
        )
    }

    /// Run a candidate through the admission pipeline.
    pub fn admit(
        &self,
        raw: &[u8],
        broadcast_id: Option<BroadcastId>,
        arrival_time: u64,
    ) -> Result<Admitted, EngineError> {
        let tx = parse_tx_bytes(raw).map_err(|e| ZcError::ScriptInvalid(e.to_string()))?;
        if tx.is_coinbase() {
            return Err(ZcError::ScriptInvalid("coinbase cannot be relayed".into()).into());
        }
        let txid = tx.txid;

        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.txs.get(&txid) {
            return Ok(Admitted::Duplicate {
                txid,
                zc_index: existing.zc_index,
                touched: existing.touched.iter().cloned().collect(),
            });
        }

        // Resolve every input against chain + zc store, collecting the
        // replacement set along the way.
        let mut consumed = Vec::with_capacity(tx.inputs.len());
        let mut parents = HashSet::new();
        let mut replaced: HashSet<TxHash> = HashSet::new();
        let mut input_total = 0u64;

        for input in &tx.inputs {
            let outpoint = input.outpoint;

            if let Some(spender) = state.spenders.get(&outpoint).copied() {
                // Conflicting zc; replacement policy decides.
                let resident = &state.txs[&spender];
                if !resident.tx.signals_rbf() {
                    return Err(ZcError::DoubleSpent(hex::encode(spender)).into());
                }
                replaced.insert(spender);
            }

            let (value, script) = if let Some(stxo) = self.chain_stxo(&outpoint)? {
                if stxo.spender.is_some() {
                    return Err(ZcError::AlreadySpentOnChain.into());
                }
                (stxo.value, stxo.script)
            } else if let Some(parent) = state.txs.get(&outpoint.txid) {
                let Some(output) = parent.tx.outputs.get(outpoint.index as usize) else {
                    return Err(ZcError::UnknownParent.into());
                };
                parents.insert(outpoint.txid);
                (output.value, output.script.clone())
            } else {
                return Err(ZcError::UnknownParent.into());
            };

            input_total += value;
            consumed.push((outpoint, value, scripthash_of(&script), script));
        }

        // Script evaluation against the resolved outputs.
        for (index, (_, value, _, script)) in consumed.iter().enumerate() {
            verify_input(&self.secp, &tx, index, script, *value)?;
        }

        let output_total = tx.total_output_value();
        if output_total > input_total {
            return Err(ZcError::ScriptInvalid("outputs exceed inputs".into()).into());
        }
        let fee = input_total - output_total;

        // Fee rule: strictly more than the whole set being evicted.
        if !replaced.is_empty() {
            let evict_set = state.transitive_descendants(&replaced);
            let evicted_fees: u64 = evict_set.iter().map(|h| state.txs[h].fee).sum();
            if fee <= evicted_fees {
                return Err(ZcError::ReplacementRejected(format!(
                    "fee {} does not beat evicted set fee {}",
                    fee, evicted_fees
                ))
                .into());
            }
        }

        let mut evicted = Vec::new();
        if !replaced.is_empty() {
            evicted = state.evict_set(&replaced, ZcError::Replaced);
            for eviction in &evicted {
                self.delete_snapshot(&eviction.txid);
            }
            // A replaced parent cannot stay a parent.
            parents.retain(|p| state.txs.contains_key(p));
        }

        // Balance deltas and touched scripthashes.
        let mut touched: HashSet<ScriptHash> = HashSet::new();
        let mut deltas: HashMap<ScriptHash, i64> = HashMap::new();
        for output in &tx.outputs {
            if let Some(sh) = scripthash_of(&output.script) {
                *deltas.entry(sh.clone()).or_insert(0) += output.value as i64;
                touched.insert(sh);
            }
        }
        let consumed: Vec<(Outpoint, u64, Option<ScriptHash>)> = consumed
            .into_iter()
            .map(|(outpoint, value, scripthash, _)| {
                if let Some(sh) = &scripthash {
                    *deltas.entry(sh.clone()).or_insert(0) -= value as i64;
                    touched.insert(sh.clone());
                }
                (outpoint, value, scripthash)
            })
            .collect();

        let zc_index = state.next_index;
        state.next_index += 1;

        for (outpoint, _, _) in &consumed {
            state.spenders.insert(*outpoint, txid);
        }
        for parent in &parents {
            state.children.entry(*parent).or_default().insert(txid);
        }
        for sh in &touched {
            state.matcher.entry(sh.clone()).or_default().insert(txid);
        }

        let entry = ZcEntry {
            tx,
            arrival_time,
            zc_index,
            consumed,
            touched: touched.clone(),
            deltas,
            parents,
            broadcast_id,
            fee,
        };
        self.persist_snapshot(&entry);
        state.txs.insert(txid, entry);

        crate::metrics::ZC_ADMITTED.inc();
        debug!(txid = %crate::types::DisplayHash(&txid), zc_index, "admitted zero-conf transaction");
        Ok(Admitted::Fresh {
            txid,
            zc_index,
            touched: touched.into_iter().collect(),
            evicted,
        })
    }

    fn persist_snapshot(&self, entry: &ZcEntry) {
        let record = ZcPersistRecord {
            raw: entry.tx.raw.clone(),
            arrival_time: entry.arrival_time,
            zc_index: entry.zc_index,
            broadcast_id: entry.broadcast_id,
        };
        let result = self.store.cf(CF_ZEROCONF).and_then(|cf| {
            self.store
                .db()
                .put_cf(cf, keys::zc_key(&entry.tx.txid), encode(&record)?)
                .map_err(ChainError::from)
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist zc snapshot");
        }
    }

    fn delete_snapshot(&self, txid: &TxHash) {
        let result = self.store.cf(CF_ZEROCONF).and_then(|cf| {
            self.store
                .db()
                .delete_cf(cf, keys::zc_key(txid))
                .map_err(ChainError::from)
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to delete zc snapshot");
        }
    }

    /// React to a committed main-branch block: drop mined zcs silently and
    /// evict whatever now conflicts with the chain.
    pub fn process_new_block(&self, mined: &HashSet<TxHash>) -> BlockSweep {
        let mut state = self.state.write().unwrap();
        let mut sweep = BlockSweep::default();

        for txid in mined {
            if state.remove_entry(txid).is_some() {
                self.delete_snapshot(txid);
                sweep.confirmed.push(*txid);
            }
        }

        // Revalidate survivors in admission order.
        let mut order: Vec<(u64, TxHash)> = state
            .txs
            .values()
            .map(|e| (e.zc_index, e.tx.txid))
            .collect();
        order.sort_unstable();

        for (_, txid) in order {
            if !state.txs.contains_key(&txid) {
                continue; // already evicted transitively
            }
            let mut reason = None;
            {
                let entry = &state.txs[&txid];
                for (outpoint, _, _) in &entry.consumed {
                    if state.txs.contains_key(&outpoint.txid) {
                        continue; // still chained to a resident zc
                    }
                    match self.chain_stxo(outpoint) {
                        Ok(Some(stxo)) => match stxo.spender {
                            Some(spent) if spent.txid != txid => {
                                reason = Some(ZcError::DoubleSpent(hex::encode(spent.txid)));
                                break;
                            }
                            _ => {}
                        },
                        Ok(None) => {
                            reason = Some(ZcError::UnknownParent);
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "store read during zc revalidation");
                            break;
                        }
                    }
                }
            }
            if let Some(reason) = reason {
                let mut seed = HashSet::new();
                seed.insert(txid);
                let evicted = state.evict_set(&seed, reason);
                for eviction in &evicted {
                    self.delete_snapshot(&eviction.txid);
                }
                sweep.evicted.extend(evicted);
            }
        }
        sweep
    }

    /// Rebuild zc state across a reorg: reinject the transactions from the
    /// undone blocks in their original order (minus those re-mined on the
    /// new branch), then revalidate everything against the new tip.
    pub fn reorg(
        &self,
        undone_txs: &[ParsedTx],
        applied_txids: &HashSet<TxHash>,
        arrival_time: u64,
    ) -> (Vec<Admitted>, BlockSweep) {
        let mut admitted = Vec::new();
        for tx in undone_txs {
            if tx.is_coinbase() || applied_txids.contains(&tx.txid) {
                continue;
            }
            match self.admit(&tx.raw, None, arrival_time) {
                Ok(result) => admitted.push(result),
                Err(e) => debug!(error = %e, "orphaned transaction not reinjected"),
            }
        }
        let sweep = self.process_new_block(applied_txids);
        (admitted, sweep)
    }

    /// Evict entries older than `max_age_secs`, children included.
    pub fn purge_expired(&self, now: u64, max_age_secs: u64) -> Vec<Evicted> {
        let mut state = self.state.write().unwrap();
        let expired: HashSet<TxHash> = state
            .txs
            .values()
            .filter(|e| now.saturating_sub(e.arrival_time) > max_age_secs)
            .map(|e| e.tx.txid)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        let evicted = state.evict_set(&expired, ZcError::Expired);
        for eviction in &evicted {
            self.delete_snapshot(&eviction.txid);
        }
        evicted
    }

    pub fn contains(&self, txid: &TxHash) -> bool {
        self.state.read().unwrap().txs.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn top_index(&self) -> u64 {
        self.state.read().unwrap().next_index
    }

    pub fn raw_tx(&self, txid: &TxHash) -> Option<Vec<u8>> {
        self.state
            .read()
            .unwrap()
            .txs
            .get(txid)
            .map(|e| e.tx.raw.clone())
    }

    /// Ledger overlay for a scripthash set (all residents when empty).
    pub fn ledger_overlay(&self, scripthashes: &[ScriptHash]) -> Vec<ZcLedgerInfo> {
        let state = self.state.read().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if scripthashes.is_empty() {
            for entry in state.txs.values() {
                out.push(entry.ledger_info());
            }
        } else {
            for sh in scripthashes {
                if let Some(txids) = state.matcher.get(sh) {
                    for txid in txids {
                        if seen.insert(*txid) {
                            out.push(state.txs[txid].ledger_info());
                        }
                    }
                }
            }
        }
        out.sort_by_key(|info| info.zc_index);
        out
    }

    /// Net unconfirmed delta per scripthash.
    pub fn deltas_for(&self, scripthashes: &[ScriptHash]) -> HashMap<ScriptHash, i64> {
        let state = self.state.read().unwrap();
        let mut out = HashMap::new();
        for sh in scripthashes {
            if let Some(txids) = state.matcher.get(sh) {
                let mut total = 0i64;
                for txid in txids {
                    if let Some(delta) = state.txs[txid].deltas.get(sh) {
                        total += delta;
                    }
                }
                if total != 0 {
                    out.insert(sh.clone(), total);
                }
            }
        }
        out
    }

    /// Unconfirmed outpoints credited to the scripthash set above the
    /// zc-index cutoff.
    pub fn outpoints_for(
        &self,
        scripthashes: &[ScriptHash],
        zc_cutoff: u64,
    ) -> Vec<(ScriptHash, Vec<OutpointRecord>)> {
        let state = self.state.read().unwrap();
        let mut out = Vec::new();
        for sh in scripthashes {
            let mut records = Vec::new();
            if let Some(txids) = state.matcher.get(sh) {
                for txid in txids {
                    let entry = &state.txs[txid];
                    if entry.zc_index < zc_cutoff {
                        continue;
                    }
                    for (index, output) in entry.tx.outputs.iter().enumerate() {
                        if scripthash_of(&output.script).as_ref() != Some(sh) {
                            continue;
                        }
                        records.push(OutpointRecord {
                            txid: *txid,
                            index: index as u32,
                            value: output.value,
                            height: None,
                            zc_index: Some(entry.zc_index),
                            spender: None,
                        });
                    }
                }
            }
            records.sort_by_key(|r| r.zc_index);
            out.push((sh.clone(), records));
        }
        out
    }

    /// Spentness against the zc store; unknown hashes are `Invalid`.
    pub fn zc_spentness(
        &self,
        requests: &[(Vec<u8>, Vec<u32>)],
    ) -> Result<Vec<(Vec<u8>, Vec<(u32, ZcSpentness)>)>, EngineError> {
        for (hash, _) in requests {
            if hash.len() != 32 {
                return Err(crate::error::InputError::MalformedRequest(format!(
                    "outpoint hash must be 32 bytes, got {}",
                    hash.len()
                ))
                .into());
            }
        }
        let state = self.state.read().unwrap();
        let mut results = Vec::with_capacity(requests.len());
        for (hash, indices) in requests {
            let mut txid = [0u8; 32];
            txid.copy_from_slice(hash);
            let mut states = Vec::with_capacity(indices.len());
            for &index in indices {
                let spentness = match state.txs.get(&txid) {
                    None => ZcSpentness::Invalid,
                    Some(entry) if (index as usize) >= entry.tx.outputs.len() => {
                        ZcSpentness::Invalid
                    }
                    Some(_) => match state.spenders.get(&Outpoint::new(txid, index)) {
                        Some(spender) => ZcSpentness::SpentByZc { spender: *spender },
                        None => ZcSpentness::Unspent,
                    },
                };
                states.push((index, spentness));
            }
            results.push((hash.clone(), states));
        }
        Ok(results)
    }

    pub fn ledger_info_of(&self, txid: &TxHash) -> Option<ZcLedgerInfo> {
        self.state
            .read()
            .unwrap()
            .txs
            .get(txid)
            .map(|e| e.ledger_info())
    }

    pub fn broadcast_id_of(&self, txid: &TxHash) -> Option<BroadcastId> {
        self.state
            .read()
            .unwrap()
            .txs
            .get(txid)
            .and_then(|e| e.broadcast_id)
    }
}

impl ZcState {
    /// Seed set plus every zc that transitively depends on it.
    fn transitive_descendants(&self, seed: &HashSet<TxHash>) -> HashSet<TxHash> {
        let mut out = seed.clone();
        let mut queue: VecDeque<TxHash> = seed.iter().copied().collect();
        while let Some(txid) = queue.pop_front() {
            if let Some(children) = self.children.get(&txid) {
                for child in children {
                    if out.insert(*child) {
                        queue.push_back(*child);
                    }
                }
            }
        }
        out
    }

    fn remove_entry(&mut self, txid: &TxHash) -> Option<ZcEntry> {
        let entry = self.txs.remove(txid)?;
        for (outpoint, _, _) in &entry.consumed {
            if self.spenders.get(outpoint) == Some(txid) {
                self.spenders.remove(outpoint);
            }
        }
        for parent in &entry.parents {
            if let Some(children) = self.children.get_mut(parent) {
                children.remove(txid);
            }
        }
        self.children.remove(txid);
        for sh in &entry.touched {
            if let Some(set) = self.matcher.get_mut(sh) {
                set.remove(txid);
                if set.is_empty() {
                    self.matcher.remove(sh);
                }
            }
        }
        Some(entry)
    }

    fn evict_set(&mut self, seed: &HashSet<TxHash>, reason: ZcError) -> Vec<Evicted> {
        let set = self.transitive_descendants(seed);
        let mut order: Vec<(u64, TxHash)> = set
            .iter()
            .filter_map(|h| self.txs.get(h).map(|e| (e.zc_index, *h)))
            .collect();
        order.sort_unstable();

        let mut evicted = Vec::new();
        for (_, txid) in order {
            if let Some(entry) = self.remove_entry(&txid) {
                crate::metrics::ZC_EVICTED.inc();
                evicted.push(Evicted {
                    txid,
                    broadcast_id: entry.broadcast_id,
                    touched: entry.touched.into_iter().collect(),
                    reason: reason.clone(),
                });
            }
        }
        evicted
    }
}
