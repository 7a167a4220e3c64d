/// Index Writer
///
/// Builds the storage model from parsed blocks and commits it in
/// height-ordered batches. Single-threaded by design: every mutation for
/// one block goes into one atomic WriteBatch, so a crash can lose the tail
/// block but never expose half of one.
///
/// Apply path per block:
/// 1. every output -> stxo record + outpoint resolver entry + subssh credit
/// 2. every input  -> spender set on the consumed stxo, producing entry
///    marked spent, spend-side subssh record at the spending height
/// 3. ssh rollup and txio counts updated, version bumped
/// 4. txhints appended, blkdata + height index written, progress advanced
///
/// Undo reverses all of it in reverse transaction order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::batch::AtomicBatchWriter;
use crate::db::{
    encode, BlockDataRecord, HeaderRecord, OutpointRef, ProgressRecord, SpentBy, SshRecord,
    StoreHandles, StxoRecord, SubSshEntry, CF_BLKDATA, CF_HEADERS, CF_HISTORY, CF_SSH, CF_STXO,
    CF_SUBSSH, CF_TXHINTS,
};
use crate::error::ChainError;
use crate::headers::HeaderEntry;
use crate::keys;
use crate::parser::ParsedBlock;
use crate::script::scripthash_of;
use crate::types::{ScriptHash, TxHash, TxPosition};

/// Startup mode for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Pick up from the committed progress record.
    Resume,
    /// Discard everything, headers included.
    Rebuild,
    /// Keep headers, rebuild all block-derived state.
    Rescan,
    /// Keep subssh, rebuild only the ssh rollup. Fast path after schema
    /// upgrades.
    RescanSsh,
}

/// In-flight view of records touched while building one block's batch.
/// Intra-block spends (tx2 consuming tx1's output) resolve against this
/// before falling back to the committed store.
#[derive(Default)]
struct Staged {
    stxo: HashMap<Vec<u8>, Option<StxoRecord>>,
    outpoints: HashMap<Vec<u8>, Option<OutpointRef>>,
    subssh: HashMap<Vec<u8>, Vec<SubSshEntry>>,
    ssh: HashMap<ScriptHash, SshRecord>,
    hints: HashMap<Vec<u8>, Vec<TxPosition>>,
}

pub struct IndexWriter {
    store: Arc<StoreHandles>,
}

impl IndexWriter {
    pub fn new(store: Arc<StoreHandles>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<StoreHandles> {
        &self.store
    }

    pub fn progress(&self) -> Result<Option<ProgressRecord>, ChainError> {
        self.store.progress(CF_BLKDATA)
    }

    /// Stage a header-chain entry; called by the organizer for every header
    /// it accepts, main branch or not.
    pub fn put_header(&self, hash: &TxHash, entry: &HeaderEntry) -> Result<(), ChainError> {
        let record = HeaderRecord {
            raw_header: entry.raw.bytes.to_vec(),
            height: entry.height,
            branch_id: entry.branch_id,
            cumulative_work: entry.cumulative_work,
            location: entry.location,
        };
        let cf = self.store.cf(CF_HEADERS)?;
        self.store
            .db()
            .put_cf(cf, keys::header_key(hash), encode(&record)?)?;
        Ok(())
    }

    fn load_staged_stxo(
        &self,
        staged: &mut Staged,
        key: Vec<u8>,
    ) -> Result<Option<StxoRecord>, ChainError> {
        if let Some(record) = staged.stxo.get(&key) {
            return Ok(record.clone());
        }
        let record: Option<StxoRecord> = self.store.get_record(CF_STXO, &key)?;
        staged.stxo.insert(key, record.clone());
        Ok(record)
    }

    fn load_staged_outpoint(
        &self,
        staged: &mut Staged,
        key: Vec<u8>,
    ) -> Result<Option<OutpointRef>, ChainError> {
        if let Some(r) = staged.outpoints.get(&key) {
            return Ok(*r);
        }
        let record: Option<OutpointRef> = self.store.get_record(CF_STXO, &key)?;
        staged.outpoints.insert(key, record);
        Ok(record)
    }

    fn load_staged_subssh(
        &self,
        staged: &mut Staged,
        key: Vec<u8>,
    ) -> Result<(), ChainError> {
        if !staged.subssh.contains_key(&key) {
            let entries: Vec<SubSshEntry> =
                self.store.get_record(CF_SUBSSH, &key)?.unwrap_or_default();
            staged.subssh.insert(key, entries);
        }
        Ok(())
    }

    fn load_staged_ssh(
        &self,
        staged: &mut Staged,
        scripthash: &[u8],
    ) -> Result<(), ChainError> {
        if !staged.ssh.contains_key(scripthash) {
            let record: SshRecord = self
                .store
                .get_record(CF_SSH, &keys::ssh_key(scripthash))?
                .unwrap_or_default();
            staged.ssh.insert(scripthash.to_vec(), record);
        }
        Ok(())
    }

    /// Apply one main-branch block atomically. `location` is where the
    /// block sits on disk; `progress` describes the read position after it.
    pub fn apply_block(
        &self,
        height: u32,
        block: &ParsedBlock,
        location: crate::types::BlockLocation,
        progress: ProgressRecord,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        let mut staged = Staged::default();
        let mut batch = AtomicBatchWriter::new(usize::MAX);

        for (tx_index, tx) in block.txs.iter().enumerate() {
            let tx_index = tx_index as u16;

            // Outputs first so intra-block spends can resolve them.
            for (out_index, output) in tx.outputs.iter().enumerate() {
                let Some(scripthash) = scripthash_of(&output.script) else {
                    continue;
                };
                let out_index = out_index as u16;
                let stxo_key = keys::stxo_key(height, tx_index, out_index);
                staged.stxo.insert(
                    stxo_key,
                    Some(StxoRecord {
                        value: output.value,
                        script: output.script.clone(),
                        spender: None,
                    }),
                );
                staged.outpoints.insert(
                    keys::outpoint_key(&tx.txid, out_index as u32),
                    Some(OutpointRef { height, tx_index }),
                );

                let subssh_key = keys::subssh_key(&scripthash, height);
                self.load_staged_subssh(&mut staged, subssh_key.clone())?;
                staged.subssh.get_mut(&subssh_key).unwrap().push(SubSshEntry {
                    tx_index,
                    index: out_index,
                    value: output.value,
                    is_input: false,
                    is_spent: false,
                });

                self.load_staged_ssh(&mut staged, &scripthash)?;
                let ssh = staged.ssh.get_mut(&scripthash).unwrap();
                ssh.confirmed_balance += output.value;
                ssh.total_received += output.value;
                ssh.txio_count += 1;
            }

            for input in &tx.inputs {
                if input.is_coinbase() {
                    continue;
                }
                let op_key = keys::outpoint_key(&input.outpoint.txid, input.outpoint.index);
                let Some(op_ref) = self.load_staged_outpoint(&mut staged, op_key)? else {
                    // Spend of an output this index never tracked.
                    debug!(height, "input consumes untracked outpoint");
                    continue;
                };
                let stxo_key =
                    keys::stxo_key(op_ref.height, op_ref.tx_index, input.outpoint.index as u16);
                let Some(mut stxo) = self.load_staged_stxo(&mut staged, stxo_key.clone())? else {
                    return Err(ChainError::StoreIO(format!(
                        "outpoint resolver points at missing stxo {}:{}",
                        op_ref.height, op_ref.tx_index
                    )));
                };
                stxo.spender = Some(SpentBy {
                    txid: tx.txid,
                    height,
                });
                let value = stxo.value;
                let scripthash = scripthash_of(&stxo.script);
                staged.stxo.insert(stxo_key, Some(stxo));

                let Some(scripthash) = scripthash else { continue };

                // Mark the producing entry spent at its own height.
                let producing_key = keys::subssh_key(&scripthash, op_ref.height);
                self.load_staged_subssh(&mut staged, producing_key.clone())?;
                for entry in staged.subssh.get_mut(&producing_key).unwrap() {
                    if entry.tx_index == op_ref.tx_index
                        && entry.index == input.outpoint.index as u16
                        && !entry.is_input
                    {
                        entry.is_spent = true;
                    }
                }

                // And record the outflow at the spending height.
                let spend_key = keys::subssh_key(&scripthash, height);
                self.load_staged_subssh(&mut staged, spend_key.clone())?;
                staged.subssh.get_mut(&spend_key).unwrap().push(SubSshEntry {
                    tx_index,
                    index: input.outpoint.index as u16,
                    value,
                    is_input: true,
                    is_spent: true,
                });

                self.load_staged_ssh(&mut staged, &scripthash)?;
                let ssh = staged.ssh.get_mut(&scripthash).unwrap();
                ssh.confirmed_balance = ssh.confirmed_balance.saturating_sub(value);
                ssh.txio_count += 1;
            }

            // Txhint entry for hash -> location resolution.
            let hint_key = keys::txhint_key(&tx.txid);
            if !staged.hints.contains_key(&hint_key) {
                let existing: Vec<TxPosition> = self
                    .store
                    .get_record(CF_TXHINTS, &hint_key)?
                    .unwrap_or_default();
                staged.hints.insert(hint_key.clone(), existing);
            }
            staged
                .hints
                .get_mut(&hint_key)
                .unwrap()
                .push(TxPosition { height, tx_index });
        }

        // Stage everything into the batch.
        for (key, record) in &staged.stxo {
            match record {
                Some(r) => batch.put(CF_STXO, key.clone(), encode(r)?),
                None => batch.delete(CF_STXO, key.clone()),
            }
        }
        for (key, record) in &staged.outpoints {
            match record {
                Some(r) => batch.put(CF_STXO, key.clone(), encode(r)?),
                None => batch.delete(CF_STXO, key.clone()),
            }
        }
        for (key, entries) in &staged.subssh {
            if entries.is_empty() {
                batch.delete(CF_SUBSSH, key.clone());
            } else {
                batch.put(CF_SUBSSH, key.clone(), encode(entries)?);
            }
        }
        for (scripthash, ssh) in &mut staged.ssh {
            ssh.version += 1;
            batch.put(CF_SSH, keys::ssh_key(scripthash), encode(ssh)?);
            batch.put(
                CF_HISTORY,
                keys::txio_count_key(scripthash),
                encode(&ssh.txio_count)?,
            );
        }
        for (key, hints) in &staged.hints {
            batch.put(CF_TXHINTS, key.clone(), encode(hints)?);
        }

        batch.put(
            CF_BLKDATA,
            keys::blkdata_key(height),
            encode(&BlockDataRecord {
                hash,
                location,
                txids: block.txs.iter().map(|tx| tx.txid).collect(),
                witness_flags: block.txs.iter().map(|tx| tx.has_witness).collect(),
            })?,
        );
        batch.put(CF_HEADERS, keys::height_index_key(height), hash.to_vec());

        let progress_bytes = encode(&progress)?;
        for cf in [CF_BLKDATA, CF_STXO, CF_SUBSSH, CF_SSH, CF_TXHINTS, CF_HISTORY] {
            batch.put(cf, keys::PROGRESS_KEY.to_vec(), progress_bytes.clone());
        }

        batch.flush(self.store.db())?;
        crate::metrics::BLOCKS_INDEXED.inc();
        debug!(height, hash = %crate::types::DisplayHash(&hash), txs = block.txs.len(), "applied block");
        Ok(())
    }

    /// Undo one block during reorg, reversing `apply_block` exactly.
    pub fn undo_block(
        &self,
        height: u32,
        block: &ParsedBlock,
        progress: ProgressRecord,
    ) -> Result<(), ChainError> {
        let mut staged = Staged::default();
        let mut batch = AtomicBatchWriter::new(usize::MAX);
        let mut touched: HashMap<ScriptHash, ()> = HashMap::new();

        for (tx_index, tx) in block.txs.iter().enumerate().rev() {
            let tx_index = tx_index as u16;

            // Reverse the spends: restore stxo spenders and producing
            // entries, and give the spent value back to the rollup.
            // Same-height producers get their records deleted afterwards
            // by the output pass, which overwrites these restorations.
            for input in &tx.inputs {
                if input.is_coinbase() {
                    continue;
                }
                let op_key = keys::outpoint_key(&input.outpoint.txid, input.outpoint.index);
                let Some(op_ref) = self.load_staged_outpoint(&mut staged, op_key)? else {
                    continue;
                };
                let stxo_key =
                    keys::stxo_key(op_ref.height, op_ref.tx_index, input.outpoint.index as u16);
                let Some(mut stxo) = self.load_staged_stxo(&mut staged, stxo_key.clone())? else {
                    continue;
                };
                stxo.spender = None;
                let value = stxo.value;
                let scripthash = scripthash_of(&stxo.script);
                staged.stxo.insert(stxo_key, Some(stxo));

                let Some(scripthash) = scripthash else { continue };
                let producing_key = keys::subssh_key(&scripthash, op_ref.height);
                self.load_staged_subssh(&mut staged, producing_key.clone())?;
                for entry in staged.subssh.get_mut(&producing_key).unwrap() {
                    if entry.tx_index == op_ref.tx_index
                        && entry.index == input.outpoint.index as u16
                        && !entry.is_input
                    {
                        entry.is_spent = false;
                    }
                }

                self.load_staged_ssh(&mut staged, &scripthash)?;
                let ssh = staged.ssh.get_mut(&scripthash).unwrap();
                ssh.confirmed_balance += value;
                ssh.txio_count = ssh.txio_count.saturating_sub(1);
                touched.insert(scripthash, ());
            }

            // Remove the outputs this tx created.
            for (out_index, output) in tx.outputs.iter().enumerate() {
                let Some(scripthash) = scripthash_of(&output.script) else {
                    continue;
                };
                let out_index = out_index as u16;
                staged
                    .stxo
                    .insert(keys::stxo_key(height, tx_index, out_index), None);
                staged
                    .outpoints
                    .insert(keys::outpoint_key(&tx.txid, out_index as u32), None);

                self.load_staged_ssh(&mut staged, &scripthash)?;
                let ssh = staged.ssh.get_mut(&scripthash).unwrap();
                ssh.confirmed_balance = ssh.confirmed_balance.saturating_sub(output.value);
                ssh.total_received = ssh.total_received.saturating_sub(output.value);
                ssh.txio_count = ssh.txio_count.saturating_sub(1);
                touched.insert(scripthash, ());

                // The whole subssh record at this height dies below.
                let subssh_key = keys::subssh_key(&scripthash, height);
                staged.subssh.insert(subssh_key, Vec::new());
            }

            // Trim the txhint list.
            let hint_key = keys::txhint_key(&tx.txid);
            if !staged.hints.contains_key(&hint_key) {
                let existing: Vec<TxPosition> = self
                    .store
                    .get_record(CF_TXHINTS, &hint_key)?
                    .unwrap_or_default();
                staged.hints.insert(hint_key.clone(), existing);
            }
            staged
                .hints
                .get_mut(&hint_key)
                .unwrap()
                .retain(|p| !(p.height == height && p.tx_index == tx_index));
        }

        // Spend-side records written at this height also die with it. The
        // input loop above may have touched scripthashes that had no output
        // at this height.
        for scripthash in touched.keys() {
            staged
                .subssh
                .entry(keys::subssh_key(scripthash, height))
                .or_default()
                .clear();
        }

        for (key, record) in &staged.stxo {
            match record {
                Some(r) => batch.put(CF_STXO, key.clone(), encode(r)?),
                None => batch.delete(CF_STXO, key.clone()),
            }
        }
        for (key, record) in &staged.outpoints {
            match record {
                Some(r) => batch.put(CF_STXO, key.clone(), encode(r)?),
                None => batch.delete(CF_STXO, key.clone()),
            }
        }
        for (key, entries) in &staged.subssh {
            if entries.is_empty() {
                batch.delete(CF_SUBSSH, key.clone());
            } else {
                batch.put(CF_SUBSSH, key.clone(), encode(entries)?);
            }
        }
        for (scripthash, ssh) in &mut staged.ssh {
            ssh.version += 1;
            batch.put(CF_SSH, keys::ssh_key(scripthash), encode(ssh)?);
            batch.put(
                CF_HISTORY,
                keys::txio_count_key(scripthash),
                encode(&ssh.txio_count)?,
            );
        }
        for (key, hints) in &staged.hints {
            if hints.is_empty() {
                batch.delete(CF_TXHINTS, key.clone());
            } else {
                batch.put(CF_TXHINTS, key.clone(), encode(hints)?);
            }
        }

        batch.delete(CF_BLKDATA, keys::blkdata_key(height));
        batch.delete(CF_HEADERS, keys::height_index_key(height));

        let progress_bytes = encode(&progress)?;
        for cf in [CF_BLKDATA, CF_STXO, CF_SUBSSH, CF_SSH, CF_TXHINTS, CF_HISTORY] {
            batch.put(cf, keys::PROGRESS_KEY.to_vec(), progress_bytes.clone());
        }

        batch.flush(self.store.db())?;
        info!(height, "undid block");
        Ok(())
    }

    /// Rebuild every ssh rollup by folding subssh, leaving subssh itself
    /// untouched.
    pub fn rescan_ssh(&self) -> Result<usize, ChainError> {
        use rocksdb::IteratorMode;

        let cf = self.store.cf(CF_SUBSSH)?;
        let mut rollups: HashMap<ScriptHash, SshRecord> = HashMap::new();

        for item in self.store.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(ChainError::from)?;
            if key.is_empty() || key[0] != b'A' {
                continue;
            }
            let hash_len = key[1] as usize;
            if key.len() != 2 + hash_len + 4 {
                continue;
            }
            let scripthash = key[2..2 + hash_len].to_vec();
            let entries: Vec<SubSshEntry> = crate::db::decode(&value)?;

            let ssh = rollups.entry(scripthash).or_default();
            for entry in &entries {
                ssh.txio_count += 1;
                if entry.is_input {
                    ssh.confirmed_balance = ssh.confirmed_balance.saturating_sub(entry.value);
                } else {
                    ssh.total_received += entry.value;
                    ssh.confirmed_balance += entry.value;
                }
            }
        }

        let mut batch = AtomicBatchWriter::new(usize::MAX);
        let rebuilt = rollups.len();
        for (scripthash, mut ssh) in rollups {
            ssh.version = 1;
            batch.put(CF_SSH, keys::ssh_key(&scripthash), encode(&ssh)?);
            batch.put(
                CF_HISTORY,
                keys::txio_count_key(&scripthash),
                encode(&ssh.txio_count)?,
            );
        }
        batch.flush(self.store.db())?;
        info!(scripthashes = rebuilt, "rebuilt ssh rollups from subssh");
        Ok(rebuilt)
    }
}
