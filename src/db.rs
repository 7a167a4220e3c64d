/// Index Store
///
/// Rocksdb wrapper owning the column families of the on-disk schema. All
/// writers funnel through the index writer's batches; readers hit the same
/// handles concurrently and see state at least as new as the last committed
/// block. The db directory carries an advisory lock so two engines cannot
/// open the same index.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ChainError;
use crate::keys::{PROGRESS_KEY, SCHEMA_KEY};
use crate::types::{BlockLocation, TxHash};

pub const SCHEMA_VERSION: u32 = 1;

pub const CF_HEADERS: &str = "headers";
pub const CF_BLKDATA: &str = "blkdata";
pub const CF_SSH: &str = "ssh";
pub const CF_SUBSSH: &str = "subssh";
pub const CF_STXO: &str = "stxo";
pub const CF_TXHINTS: &str = "txhints";
pub const CF_ZEROCONF: &str = "zeroconf";
pub const CF_HISTORY: &str = "history";

pub const COLUMN_FAMILIES: [&str; 8] = [
    CF_HEADERS,
    CF_BLKDATA,
    CF_SSH,
    CF_SUBSSH,
    CF_STXO,
    CF_TXHINTS,
    CF_ZEROCONF,
    CF_HISTORY,
];

/// Stored form of a header-chain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub raw_header: Vec<u8>,
    pub height: u32,
    pub branch_id: u32,
    pub cumulative_work: [u8; 32],
    pub location: Option<BlockLocation>,
}

/// Main-branch block body coordinates by height, with the txid list so
/// `(height, tx_index)` positions resolve without re-reading the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDataRecord {
    pub hash: TxHash,
    pub location: BlockLocation,
    pub txids: Vec<TxHash>,
    /// Parallel to `txids`: whether the transaction carries witness data.
    pub witness_flags: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentBy {
    pub txid: TxHash,
    pub height: u32,
}

/// One transaction output and, once spent on the main branch, its spender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StxoRecord {
    pub value: u64,
    pub script: Vec<u8>,
    pub spender: Option<SpentBy>,
}

/// Locates the stxo record for an outpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutpointRef {
    pub height: u32,
    pub tx_index: u16,
}

/// One scripthash event contributed by a height: an output credited to the
/// scripthash, or an input consuming one of its earlier outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSshEntry {
    pub tx_index: u16,
    pub index: u16,
    pub value: u64,
    /// True for the spending-side record written at the spend height.
    pub is_input: bool,
    /// For outputs: flipped when the output gets spent. Inputs are born true.
    pub is_spent: bool,
}

/// Cached rollup for one scripthash; always recomputable from subssh.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SshRecord {
    pub confirmed_balance: u64,
    pub total_received: u64,
    /// Bumped on every observable change; drives delta replies.
    pub version: u64,
    pub txio_count: u64,
}

/// Zero-confirmation snapshot surviving restarts. The admission index
/// orders reloads so dependency chains re-enter parent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZcPersistRecord {
    pub raw: Vec<u8>,
    pub arrival_time: u64,
    pub zc_index: u64,
    pub broadcast_id: Option<[u8; 6]>,
}

/// Scan progress, one per column family, committed with its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub top_height: u32,
    pub top_hash: TxHash,
    pub file_number: u16,
    pub file_offset: u64,
}

pub struct StoreHandles {
    db: Arc<DB>,
    _dir_lock: File,
}

impl StoreHandles {
    /// Open (creating if missing) and validate the store. Takes the
    /// directory lock and enforces the schema version.
    pub fn open(db_dir: &Path) -> Result<Self, ChainError> {
        std::fs::create_dir_all(db_dir)?;

        let lock_path = db_dir.join("LOCK.armorydb");
        let dir_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        dir_lock.try_lock_exclusive().map_err(|_| {
            ChainError::StoreIO(format!("database at {} is locked by another process", db_dir.display()))
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, db_dir, descriptors)
            .map_err(|e| ChainError::StoreIO(e.to_string()))?;
        let db = Arc::new(db);

        // Validate all required CFs exist before anything touches them.
        for cf_name in COLUMN_FAMILIES {
            if db.cf_handle(cf_name).is_none() {
                return Err(ChainError::StoreIO(format!(
                    "{} column family not found",
                    cf_name
                )));
            }
        }

        let handles = Self {
            db,
            _dir_lock: dir_lock,
        };
        handles.check_schema()?;
        Ok(handles)
    }

    fn check_schema(&self) -> Result<(), ChainError> {
        let cf = self.cf(CF_HEADERS)?;
        match self.db.get_cf(cf, SCHEMA_KEY)? {
            Some(bytes) => {
                let found: u32 = bincode::deserialize(&bytes)
                    .map_err(|e| ChainError::StoreIO(e.to_string()))?;
                if found != SCHEMA_VERSION {
                    return Err(ChainError::SchemaMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
            None => {
                let bytes = bincode::serialize(&SCHEMA_VERSION)
                    .map_err(|e| ChainError::StoreIO(e.to_string()))?;
                self.db.put_cf(cf, SCHEMA_KEY, bytes)?;
                info!(version = SCHEMA_VERSION, "initialized store schema");
            }
        }
        Ok(())
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    pub fn cf(&self, name: &str) -> Result<&ColumnFamily, ChainError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::StoreIO(format!("{} column family not found", name)))
    }

    /// Read with one retry on a fresh snapshot, per the recovery policy.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key) {
            Ok(v) => Ok(v),
            Err(first) => {
                tracing::warn!(cf = cf_name, error = %first, "store read failed, retrying once");
                self.db.get_cf(cf, key).map_err(ChainError::from)
            }
        }
    }

    pub fn get_record<T: for<'de> Deserialize<'de>>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>, ChainError> {
        match self.get(cf_name, key)? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| ChainError::StoreIO(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn progress(&self, cf_name: &str) -> Result<Option<ProgressRecord>, ChainError> {
        self.get_record(cf_name, &PROGRESS_KEY)
    }

    /// Drop and recreate derived column families for a rebuild/rescan.
    pub fn clear_families(&mut self, names: &[&str]) -> Result<(), ChainError> {
        let db = Arc::get_mut(&mut self.db).ok_or_else(|| {
            ChainError::StoreIO("cannot clear column families while the store is shared".into())
        })?;
        for name in names {
            db.drop_cf(name)?;
            db.create_cf(name, &Options::default())?;
            info!(cf = name, "cleared column family");
        }
        Ok(())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ChainError> {
    bincode::serialize(value).map_err(|e| ChainError::StoreIO(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ChainError> {
    bincode::deserialize(bytes).map_err(|e| ChainError::StoreIO(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_validates_and_initializes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandles::open(dir.path()).unwrap();
        for cf in COLUMN_FAMILIES {
            assert!(store.cf(cf).is_ok());
        }
        drop(store);

        // Reopen against the same schema succeeds.
        let store = StoreHandles::open(dir.path()).unwrap();
        assert!(store.progress(CF_HEADERS).unwrap().is_none());
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let _store = StoreHandles::open(dir.path()).unwrap();
        assert!(matches!(
            StoreHandles::open(dir.path()),
            Err(ChainError::StoreIO(_))
        ));
    }

    #[test]
    fn test_schema_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StoreHandles::open(dir.path()).unwrap();
            let cf = store.cf(CF_HEADERS).unwrap();
            store
                .db()
                .put_cf(cf, SCHEMA_KEY, bincode::serialize(&99u32).unwrap())
                .unwrap();
        }
        assert!(matches!(
            StoreHandles::open(dir.path()),
            Err(ChainError::SchemaMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandles::open(dir.path()).unwrap();

        let record = ProgressRecord {
            top_height: 12,
            top_hash: [0xAA; 32],
            file_number: 1,
            file_offset: 4096,
        };
        let cf = store.cf(CF_BLKDATA).unwrap();
        store
            .db()
            .put_cf(cf, PROGRESS_KEY, encode(&record).unwrap())
            .unwrap();

        let loaded = store.progress(CF_BLKDATA).unwrap().unwrap();
        assert_eq!(loaded, record);
    }
}
