/// Ledger Assembly
///
/// Builds wallet history pages on demand from subssh range scans. Pages are
/// fixed size, sorted (height DESC, tx_index DESC); unconfirmed entries sit
/// on top of page 0 sorted by zc_index DESC. The scans are bounded by the
/// page window, independent of an address's lifetime volume.

use std::collections::{BTreeMap, HashMap};

use rocksdb::{Direction, IteratorMode};
use serde::{Deserialize, Serialize};

use crate::db::{decode, BlockDataRecord, StoreHandles, SubSshEntry, CF_BLKDATA, CF_SUBSSH};
use crate::error::ChainError;
use crate::keys;
use crate::types::{ScriptHash, TxHash};

pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFlags {
    pub is_coinbase: bool,
    pub is_sent_to_self: bool,
    pub is_rbf: bool,
    pub is_chained_zc: bool,
    pub has_witness: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tx_hash: TxHash,
    /// Net value movement for the queried scripthash set.
    pub value: i64,
    /// None for unconfirmed entries.
    pub height: Option<u32>,
    pub tx_index: u32,
    pub zc_index: Option<u64>,
    pub flags: LedgerFlags,
}

/// Unconfirmed overlay the zc engine hands the ledger assembler.
#[derive(Debug, Clone)]
pub struct ZcLedgerInfo {
    pub txid: TxHash,
    pub zc_index: u64,
    pub deltas: HashMap<ScriptHash, i64>,
    pub rbf: bool,
    pub chained: bool,
    pub witness: bool,
}

/// All subssh entries for `scripthash`, newest height first, at most
/// `max_heights` heights.
fn scan_subssh_reverse(
    store: &StoreHandles,
    scripthash: &ScriptHash,
    max_heights: usize,
) -> Result<Vec<(u32, Vec<SubSshEntry>)>, ChainError> {
    let cf = store.cf(CF_SUBSSH)?;
    let upper = keys::subssh_key(scripthash, u32::MAX);
    let prefix = keys::subssh_prefix(scripthash);

    let mut out = Vec::new();
    for item in store
        .db()
        .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse))
    {
        let (key, value) = item.map_err(ChainError::from)?;
        if !key.starts_with(&prefix) {
            break;
        }
        let Some(height) = keys::subssh_key_height(&key) else {
            continue;
        };
        out.push((height, decode(&value)?));
        if out.len() >= max_heights {
            break;
        }
    }
    Ok(out)
}

fn blkdata_at(store: &StoreHandles, height: u32) -> Result<Option<BlockDataRecord>, ChainError> {
    store.get_record(CF_BLKDATA, &keys::blkdata_key(height))
}

/// Assemble one history page for a scripthash set.
pub fn history_page(
    store: &StoreHandles,
    scripthashes: &[ScriptHash],
    zc_overlay: &[ZcLedgerInfo],
    page: u32,
) -> Result<Vec<LedgerEntry>, ChainError> {
    let mut entries = Vec::new();

    // Unconfirmed head, newest zc first. Only page 0 carries it.
    if page == 0 {
        let mut zc: Vec<&ZcLedgerInfo> = zc_overlay
            .iter()
            .filter(|info| scripthashes.iter().any(|sh| info.deltas.contains_key(sh)))
            .collect();
        zc.sort_by(|a, b| b.zc_index.cmp(&a.zc_index));
        for info in zc {
            let value: i64 = scripthashes
                .iter()
                .filter_map(|sh| info.deltas.get(sh))
                .sum();
            entries.push(LedgerEntry {
                tx_hash: info.txid,
                value,
                height: None,
                tx_index: 0,
                zc_index: Some(info.zc_index),
                flags: LedgerFlags {
                    is_rbf: info.rbf,
                    is_chained_zc: info.chained,
                    has_witness: info.witness,
                    ..Default::default()
                },
            });
        }
    }

    // Confirmed history: merge per-scripthash scans into (height, tx_index)
    // groups. The scan depth is bounded by the page window.
    let needed = (page as usize + 1) * PAGE_SIZE;
    let mut groups: BTreeMap<(u32, u16), (i64, bool, bool)> = BTreeMap::new();
    for scripthash in scripthashes {
        for (height, subssh) in scan_subssh_reverse(store, scripthash, needed)? {
            for entry in subssh {
                let group = groups.entry((height, entry.tx_index)).or_insert((0, false, false));
                if entry.is_input {
                    group.0 -= entry.value as i64;
                    group.2 = true;
                } else {
                    group.0 += entry.value as i64;
                    group.1 = true;
                }
            }
        }
    }

    for ((height, tx_index), (value, has_credit, has_debit)) in groups.into_iter().rev() {
        let Some(blkdata) = blkdata_at(store, height)? else {
            continue;
        };
        let Some(tx_hash) = blkdata.txids.get(tx_index as usize).copied() else {
            continue;
        };
        entries.push(LedgerEntry {
            tx_hash,
            value,
            height: Some(height),
            tx_index: tx_index as u32,
            zc_index: None,
            flags: LedgerFlags {
                is_coinbase: tx_index == 0,
                is_sent_to_self: has_credit && has_debit,
                has_witness: blkdata
                    .witness_flags
                    .get(tx_index as usize)
                    .copied()
                    .unwrap_or(false),
                ..Default::default()
            },
        });
    }

    let start = page as usize * PAGE_SIZE;
    let end = (start + PAGE_SIZE).min(entries.len());
    if start >= entries.len() {
        return Ok(Vec::new());
    }
    Ok(entries[start..end].to_vec())
}
