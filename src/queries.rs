/// Read-Side Queries
///
/// Concurrent readers over the committed store: balances, utxos, outpoint
/// sync batches, spentness resolution and tx/header fetch. Batch calls
/// report per-item outcomes; one unknown hash never poisons the batch, but
/// a malformed (wrong-length) hash fails it whole.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rocksdb::{Direction, IteratorMode};
use serde::{Deserialize, Serialize};

use crate::block_files::BlockFileReader;
use crate::db::{
    decode, BlockDataRecord, HeaderRecord, OutpointRef, SpentBy, SshRecord, StoreHandles,
    StxoRecord, SubSshEntry, CF_BLKDATA, CF_HEADERS, CF_SSH, CF_STXO, CF_SUBSSH, CF_TXHINTS,
};
use crate::error::{ChainError, EngineError, InputError};
use crate::keys;
use crate::parser::parse_block;
use crate::types::{ScriptHash, TxHash, TxPosition};

const TX_CACHE_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spentness {
    Unspent,
    Spent { spender: TxHash, height: u32 },
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpointRecord {
    pub txid: TxHash,
    pub index: u32,
    pub value: u64,
    /// Confirmation height; None while the credit is unconfirmed.
    pub height: Option<u32>,
    pub zc_index: Option<u64>,
    pub spender: Option<SpentBy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutpointBatch {
    pub per_scripthash: Vec<(ScriptHash, Vec<OutpointRecord>)>,
    pub next_height_cutoff: u32,
    pub next_zc_cutoff: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: TxHash,
    pub vout: u32,
    pub value: u64,
    pub script: Vec<u8>,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTxRecord {
    pub raw: Vec<u8>,
    pub height: u32,
    pub tx_index: u16,
}

pub struct QueryEngine {
    store: Arc<StoreHandles>,
    reader: Arc<BlockFileReader>,
    tx_cache: Mutex<LruCache<TxHash, RawTxRecord>>,
}

impl QueryEngine {
    pub fn new(store: Arc<StoreHandles>, reader: Arc<BlockFileReader>) -> Self {
        Self {
            store,
            reader,
            tx_cache: Mutex::new(LruCache::new(NonZeroUsize::new(TX_CACHE_SIZE).unwrap())),
        }
    }

    pub fn store(&self) -> &Arc<StoreHandles> {
        &self.store
    }

    pub fn ssh(&self, scripthash: &ScriptHash) -> Result<SshRecord, ChainError> {
        Ok(self
            .store
            .get_record(CF_SSH, &keys::ssh_key(scripthash))?
            .unwrap_or_default())
    }

    pub fn balances(
        &self,
        scripthashes: &[ScriptHash],
    ) -> Result<Vec<(ScriptHash, SshRecord)>, ChainError> {
        scripthashes
            .iter()
            .map(|sh| Ok((sh.clone(), self.ssh(sh)?)))
            .collect()
    }

    fn subssh_from(
        &self,
        scripthash: &ScriptHash,
        min_height_exclusive: Option<u32>,
    ) -> Result<Vec<(u32, Vec<SubSshEntry>)>, ChainError> {
        let cf = self.store.cf(CF_SUBSSH)?;
        let prefix = keys::subssh_prefix(scripthash);
        let start = match min_height_exclusive {
            Some(h) if h < u32::MAX => keys::subssh_key(scripthash, h + 1),
            Some(_) => return Ok(Vec::new()),
            None => prefix.clone(),
        };

        let mut out = Vec::new();
        for item in self
            .store
            .db()
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(ChainError::from)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(height) = keys::subssh_key_height(&key) else {
                continue;
            };
            out.push((height, decode(&value)?));
        }
        Ok(out)
    }

    /// Unspent outputs credited to the scripthash set, optionally filtered
    /// by a minimum value.
    pub fn utxos(
        &self,
        scripthashes: &[ScriptHash],
        min_value: Option<u64>,
    ) -> Result<Vec<Utxo>, ChainError> {
        let mut utxos = Vec::new();
        for scripthash in scripthashes {
            for (height, entries) in self.subssh_from(scripthash, None)? {
                for entry in entries {
                    if entry.is_input || entry.is_spent {
                        continue;
                    }
                    if let Some(min) = min_value {
                        if entry.value < min {
                            continue;
                        }
                    }
                    let stxo_key = keys::stxo_key(height, entry.tx_index, entry.index);
                    let Some(stxo) = self.store.get_record::<StxoRecord>(CF_STXO, &stxo_key)?
                    else {
                        continue;
                    };
                    if stxo.spender.is_some() {
                        continue;
                    }
                    let Some(blkdata) = self
                        .store
                        .get_record::<BlockDataRecord>(CF_BLKDATA, &keys::blkdata_key(height))?
                    else {
                        continue;
                    };
                    let Some(txid) = blkdata.txids.get(entry.tx_index as usize) else {
                        continue;
                    };
                    utxos.push(Utxo {
                        txid: *txid,
                        vout: entry.index as u32,
                        value: entry.value,
                        script: stxo.script,
                        height,
                    });
                }
            }
        }
        Ok(utxos)
    }

    /// Incremental sync primitive: every outpoint credited to each
    /// scripthash above the height cutoff. The caller merges in the zc
    /// overlay for outpoints above the zc cutoff and fills the next
    /// cutoffs.
    pub fn outpoints_for_addresses(
        &self,
        scripthashes: &[ScriptHash],
        height_cutoff: u32,
    ) -> Result<OutpointBatch, ChainError> {
        let mut batch = OutpointBatch::default();
        let mut top_height = height_cutoff;

        for scripthash in scripthashes {
            let mut records = Vec::new();
            let from = if height_cutoff == 0 { None } else { Some(height_cutoff) };
            for (height, entries) in self.subssh_from(scripthash, from)? {
                top_height = top_height.max(height);
                for entry in entries {
                    if entry.is_input {
                        continue;
                    }
                    let stxo_key = keys::stxo_key(height, entry.tx_index, entry.index);
                    let Some(stxo) = self.store.get_record::<StxoRecord>(CF_STXO, &stxo_key)?
                    else {
                        continue;
                    };
                    let Some(blkdata) = self
                        .store
                        .get_record::<BlockDataRecord>(CF_BLKDATA, &keys::blkdata_key(height))?
                    else {
                        continue;
                    };
                    let Some(txid) = blkdata.txids.get(entry.tx_index as usize) else {
                        continue;
                    };
                    records.push(OutpointRecord {
                        txid: *txid,
                        index: entry.index as u32,
                        value: entry.value,
                        height: Some(height),
                        zc_index: None,
                        spender: stxo.spender,
                    });
                }
            }
            batch.per_scripthash.push((scripthash.clone(), records));
        }

        batch.next_height_cutoff = top_height;
        Ok(batch)
    }

    /// Spentness for arbitrary outpoint sets. Unknown 32-byte hashes come
    /// back `Invalid`; a wrong-length hash fails the whole batch.
    pub fn spentness(
        &self,
        requests: &[(Vec<u8>, Vec<u32>)],
    ) -> Result<Vec<(Vec<u8>, Vec<(u32, Spentness)>)>, EngineError> {
        for (hash, _) in requests {
            if hash.len() != 32 {
                return Err(InputError::MalformedRequest(format!(
                    "outpoint hash must be 32 bytes, got {}",
                    hash.len()
                ))
                .into());
            }
        }

        let mut results = Vec::with_capacity(requests.len());
        for (hash, indices) in requests {
            let mut txid = [0u8; 32];
            txid.copy_from_slice(hash);
            let mut states = Vec::with_capacity(indices.len());
            for &index in indices {
                states.push((index, self.outpoint_spentness(&txid, index)?));
            }
            results.push((hash.clone(), states));
        }
        Ok(results)
    }

    fn outpoint_spentness(&self, txid: &TxHash, index: u32) -> Result<Spentness, ChainError> {
        let Some(op_ref) = self
            .store
            .get_record::<OutpointRef>(CF_STXO, &keys::outpoint_key(txid, index))?
        else {
            return Ok(Spentness::Invalid);
        };
        let stxo_key = keys::stxo_key(op_ref.height, op_ref.tx_index, index as u16);
        let Some(stxo) = self.store.get_record::<StxoRecord>(CF_STXO, &stxo_key)? else {
            return Ok(Spentness::Invalid);
        };
        Ok(match stxo.spender {
            Some(spent) => Spentness::Spent {
                spender: spent.txid,
                height: spent.height,
            },
            None => Spentness::Unspent,
        })
    }

    /// Resolve a full tx hash through txhints to its raw bytes. Partial
    /// cache hits make repeat batch lookups cheap.
    pub fn tx_by_hash(&self, txid: &TxHash) -> Result<Option<RawTxRecord>, ChainError> {
        if let Some(cached) = self.tx_cache.lock().unwrap().get(txid) {
            return Ok(Some(cached.clone()));
        }

        let hints: Vec<TxPosition> = self
            .store
            .get_record(CF_TXHINTS, &keys::txhint_key(txid))?
            .unwrap_or_default();

        for position in hints {
            let Some(blkdata) = self
                .store
                .get_record::<BlockDataRecord>(CF_BLKDATA, &keys::blkdata_key(position.height))?
            else {
                continue;
            };
            if blkdata.txids.get(position.tx_index as usize) != Some(txid) {
                continue;
            }
            let raw_block = self.reader.read_at(blkdata.location)?;
            let block = parse_block(&raw_block)?;
            let Some(tx) = block.txs.get(position.tx_index as usize) else {
                continue;
            };
            let record = RawTxRecord {
                raw: tx.raw.clone(),
                height: position.height,
                tx_index: position.tx_index,
            };
            self.tx_cache.lock().unwrap().put(*txid, record.clone());
            return Ok(Some(record));
        }
        Ok(None)
    }

    pub fn tx_batch(
        &self,
        txids: &[TxHash],
    ) -> Result<Vec<(TxHash, Option<RawTxRecord>)>, ChainError> {
        txids
            .iter()
            .map(|txid| Ok((*txid, self.tx_by_hash(txid)?)))
            .collect()
    }

    pub fn header_by_hash(&self, hash: &TxHash) -> Result<Option<HeaderRecord>, ChainError> {
        self.store.get_record(CF_HEADERS, &keys::header_key(hash))
    }

    pub fn header_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError> {
        let Some(hash_bytes) = self.store.get(CF_HEADERS, &keys::height_index_key(height))? else {
            return Ok(None);
        };
        if hash_bytes.len() != 32 {
            return Ok(None);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hash_bytes);
        self.header_by_hash(&hash)
    }
}

/// Per-wallet rollup plus per-address triples filtered down to addresses
/// whose version moved past the caller's last observation.
pub fn delta_balances(
    engine: &QueryEngine,
    scripthashes: &[ScriptHash],
    last_seen: &HashMap<ScriptHash, u64>,
    zc_deltas: &HashMap<ScriptHash, i64>,
) -> Result<(crate::types::BalanceTriple, Vec<(ScriptHash, crate::types::BalanceTriple, u64)>), ChainError>
{
    let mut rollup = crate::types::BalanceTriple::default();
    let mut changed = Vec::new();
    for scripthash in scripthashes {
        let ssh = engine.ssh(scripthash)?;
        let zc = zc_deltas.get(scripthash).copied().unwrap_or(0);
        let unconfirmed = (ssh.confirmed_balance as i64 + zc).max(0) as u64;
        rollup.confirmed_balance += ssh.confirmed_balance;
        rollup.unconfirmed_balance += unconfirmed;
        rollup.total_received += ssh.total_received;

        let seen = last_seen.get(scripthash).copied().unwrap_or(0);
        if ssh.version > seen || zc != 0 {
            changed.push((
                scripthash.clone(),
                crate::types::BalanceTriple {
                    confirmed_balance: ssh.confirmed_balance,
                    unconfirmed_balance: unconfirmed,
                    total_received: ssh.total_received,
                },
                ssh.version,
            ));
        }
    }
    Ok((rollup, changed))
}
