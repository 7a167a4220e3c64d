/// Atomic Multi-CF Batch Writer
///
/// Stages put/delete operations across column families and commits them in
/// a single rocksdb WriteBatch: either every mutation for a block lands, or
/// none does. A partial commit must never be observable after restart, so
/// everything a block touches (stxo, subssh, ssh, hints, progress records)
/// goes through one of these.

use rocksdb::{WriteBatch, DB};

use crate::error::ChainError;

pub struct AtomicBatchWriter {
    operations: Vec<Operation>,
    batch_size_limit: usize,
}

enum Operation {
    Put {
        cf_name: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: &'static str,
        key: Vec<u8>,
    },
}

impl AtomicBatchWriter {
    pub fn new(batch_size_limit: usize) -> Self {
        Self {
            operations: Vec::new(),
            batch_size_limit,
        }
    }

    pub fn put(&mut self, cf_name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Put {
            cf_name,
            key,
            value,
        });
    }

    pub fn delete(&mut self, cf_name: &'static str, key: Vec<u8>) {
        self.operations.push(Operation::Delete { cf_name, key });
    }

    /// True once the batch outgrew its limit; callers flush between blocks,
    /// never inside one.
    pub fn should_flush(&self) -> bool {
        self.operations.len() >= self.batch_size_limit
    }

    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Commit everything staged as one WriteBatch.
    pub fn flush(&mut self, db: &DB) -> Result<(), ChainError> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let operations = std::mem::take(&mut self.operations);
        let mut batch = WriteBatch::default();
        for op in &operations {
            let cf_name = match op {
                Operation::Put { cf_name, .. } => cf_name,
                Operation::Delete { cf_name, .. } => cf_name,
            };
            let cf = db
                .cf_handle(cf_name)
                .ok_or_else(|| ChainError::StoreIO(format!("{} column family not found", cf_name)))?;
            match op {
                Operation::Put { key, value, .. } => batch.put_cf(cf, key, value),
                Operation::Delete { key, .. } => batch.delete_cf(cf, key),
            }
        }

        db.write(batch)
            .map_err(|e| ChainError::CommitFailed(e.to_string()))
    }

    /// Drop staged operations without writing.
    pub fn clear(&mut self) {
        self.operations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{StoreHandles, CF_SSH, CF_STXO, CF_SUBSSH};

    fn create_test_store() -> (StoreHandles, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandles::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_atomic_write_all_succeed() {
        let (store, _dir) = create_test_store();
        let mut writer = AtomicBatchWriter::new(1000);

        writer.put(CF_STXO, b"key1".to_vec(), b"value1".to_vec());
        writer.put(CF_SUBSSH, b"key2".to_vec(), b"value2".to_vec());
        writer.put(CF_SSH, b"key3".to_vec(), b"value3".to_vec());

        writer.flush(store.db()).unwrap();
        assert_eq!(writer.pending_count(), 0);

        assert_eq!(store.get(CF_STXO, b"key1").unwrap().unwrap(), b"value1");
        assert_eq!(store.get(CF_SUBSSH, b"key2").unwrap().unwrap(), b"value2");
        assert_eq!(store.get(CF_SSH, b"key3").unwrap().unwrap(), b"value3");
    }

    #[test]
    fn test_atomic_delete() {
        let (store, _dir) = create_test_store();
        let mut writer = AtomicBatchWriter::new(1000);

        writer.put(CF_STXO, b"key1".to_vec(), b"value1".to_vec());
        writer.flush(store.db()).unwrap();

        writer.delete(CF_STXO, b"key1".to_vec());
        writer.flush(store.db()).unwrap();

        assert!(store.get(CF_STXO, b"key1").unwrap().is_none());
    }

    #[test]
    fn test_should_flush() {
        let mut writer = AtomicBatchWriter::new(2);
        assert!(!writer.should_flush());

        writer.put(CF_STXO, b"key1".to_vec(), b"value1".to_vec());
        assert!(!writer.should_flush());

        writer.put(CF_SSH, b"key2".to_vec(), b"value2".to_vec());
        assert!(writer.should_flush());

        writer.clear();
        assert_eq!(writer.pending_count(), 0);
    }
}
