/// Chain Organizer
///
/// Owns the scan loop: block files -> parser -> header chain -> index
/// writer. Detects reorgs by walking headers, drives the undo/apply
/// sequence, reinjects orphaned transactions into the zc engine, and
/// publishes chain notifications. Main-branch pointers flip only after the
/// index writer finished the corresponding batches.
///
/// The organizer thread is never cancelled mid-commit: it finishes the
/// current block's batch before observing a shutdown request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::block_files::BlockFileReader;
use crate::config::ArmoryConfig;
use crate::db::{ProgressRecord, StoreHandles, CF_HEADERS};
use crate::error::ChainError;
use crate::headers::{ChainUpdate, HeaderChain};
use crate::index_writer::{IndexWriter, InitMode};
use crate::notifications::{Notification, NotificationBus, ScanPhase};
use crate::parser::{parse_block, ParsedBlock, ParsedTx};
use crate::sessions::SessionRegistry;
use crate::types::{unix_now, BlockLocation, TxHash};
use crate::zeroconf::{BlockSweep, ZcEngine};

/// Shared view of chain readiness for the dispatcher.
pub struct ChainStatus {
    pub top_height: AtomicU32,
    pub ready: AtomicBool,
}

impl ChainStatus {
    pub fn new() -> Self {
        Self {
            top_height: AtomicU32::new(0),
            ready: AtomicBool::new(false),
        }
    }

    pub fn top(&self) -> u32 {
        self.top_height.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl Default for ChainStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChainOrganizer {
    config: Arc<ArmoryConfig>,
    writer: IndexWriter,
    headers: RwLock<HeaderChain>,
    reader: Arc<BlockFileReader>,
    zc: Arc<ZcEngine>,
    bus: Arc<NotificationBus>,
    sessions: Arc<SessionRegistry>,
    status: Arc<ChainStatus>,
    shutdown: AtomicBool,
    /// Next scan position in the block files.
    scan_position: RwLock<(u16, u64)>,
}

impl ChainOrganizer {
    pub fn new(
        config: Arc<ArmoryConfig>,
        store: Arc<StoreHandles>,
        reader: Arc<BlockFileReader>,
        zc: Arc<ZcEngine>,
        bus: Arc<NotificationBus>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            writer: IndexWriter::new(store),
            headers: RwLock::new(HeaderChain::new()),
            reader,
            zc,
            bus,
            sessions,
            status: Arc::new(ChainStatus::new()),
            shutdown: AtomicBool::new(false),
            scan_position: RwLock::new((0, 0)),
        }
    }

    pub fn status(&self) -> Arc<ChainStatus> {
        self.status.clone()
    }

    pub fn store(&self) -> &Arc<StoreHandles> {
        self.writer.store()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn top_height(&self) -> Option<u32> {
        self.headers.read().unwrap().top_height()
    }

    fn publish(&self, notification: Notification) {
        self.sessions.fan_out(&notification);
        self.bus.publish(notification);
    }

    /// Prepare state for the requested startup mode.
    pub fn init(&self, mode: InitMode) -> Result<(), ChainError> {
        match mode {
            InitMode::Resume => {
                self.publish(Notification::Progress {
                    phase: ScanPhase::DbHeaders,
                    progress_pct: 0.0,
                    eta_secs: 0,
                    wallet_ids: vec![],
                });
                self.load_headers_from_store()?;
                if let Some(progress) = self.writer.progress()? {
                    *self.scan_position.write().unwrap() =
                        (progress.file_number, progress.file_offset);
                    self.status
                        .top_height
                        .store(progress.top_height, Ordering::Release);
                }
            }
            InitMode::Rebuild | InitMode::Rescan => {
                // Derived state is rebuilt from the block files; resume
                // position resets to the origin.
                *self.scan_position.write().unwrap() = (0, 0);
            }
            InitMode::RescanSsh => {
                self.publish(Notification::Progress {
                    phase: ScanPhase::Balance,
                    progress_pct: 0.0,
                    eta_secs: 0,
                    wallet_ids: vec![],
                });
                self.load_headers_from_store()?;
                self.writer.rescan_ssh()?;
                if let Some(progress) = self.writer.progress()? {
                    *self.scan_position.write().unwrap() =
                        (progress.file_number, progress.file_offset);
                    self.status
                        .top_height
                        .store(progress.top_height, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Rebuild the in-memory header chain from the headers family.
    /// Main-branch records replay first so branch decisions come out
    /// identical to the committed state.
    fn load_headers_from_store(&self) -> Result<(), ChainError> {
        use rocksdb::IteratorMode;
        let store = self.writer.store();
        let cf = store.cf(CF_HEADERS)?;

        let mut main: Vec<crate::db::HeaderRecord> = Vec::new();
        let mut side: Vec<crate::db::HeaderRecord> = Vec::new();
        for item in store.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(ChainError::from)?;
            if key.first() != Some(&b'h') {
                continue;
            }
            let record: crate::db::HeaderRecord = crate::db::decode(&value)?;
            if record.branch_id == crate::headers::MAIN_BRANCH {
                main.push(record);
            } else {
                side.push(record);
            }
        }
        main.sort_by_key(|r| r.height);
        side.sort_by_key(|r| r.height);

        let mut headers = self.headers.write().unwrap();
        for record in main {
            let raw = crate::parser::RawHeader::from_slice(&record.raw_header)?;
            for update in headers.insert(raw, record.location) {
                if let ChainUpdate::Extended { hash, .. } = update {
                    headers.commit_extend(hash)?;
                }
            }
        }
        for record in side {
            let raw = crate::parser::RawHeader::from_slice(&record.raw_header)?;
            headers.insert(raw, record.location);
        }
        info!(headers = headers.len(), "rebuilt header chain from store");
        Ok(())
    }

    /// Scan the block files from the current position until no more data,
    /// then report readiness. Returns the number of blocks ingested.
    pub fn initial_scan(&self) -> Result<usize, ChainError> {
        let started = Instant::now();
        let (file, offset) = *self.scan_position.read().unwrap();
        let mut iter = self.reader.iter_from(file, offset);
        let mut ingested = 0usize;
        let progress_log = crate::telemetry::ProgressCounter::new(10_000);

        while let Some((raw, location)) = iter.next() {
            let position = iter.position();
            self.ingest_block(&raw, location, position)?;
            ingested += 1;
            if progress_log.should_log() {
                let top = self.top_height().unwrap_or(0);
                info!(
                    blocks = ingested,
                    top,
                    elapsed_secs = started.elapsed().as_secs(),
                    "block data scan progress"
                );
                self.publish(Notification::Progress {
                    phase: ScanPhase::BlockData,
                    progress_pct: 0.0,
                    eta_secs: 0,
                    wallet_ids: vec![],
                });
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
        *self.scan_position.write().unwrap() = iter.position();

        let top = self.top_height().unwrap_or(0);
        self.status.top_height.store(top, Ordering::Release);
        if !self.status.ready.swap(true, Ordering::AcqRel) {
            self.publish(Notification::Progress {
                phase: ScanPhase::Completed,
                progress_pct: 100.0,
                eta_secs: 0,
                wallet_ids: vec![],
            });
            self.publish(Notification::Ready { top_height: top });
            info!(top, ingested, "initial scan complete");
        }
        Ok(ingested)
    }

    /// Ingest one raw block read at `location`; `position` is the scan
    /// cursor after it.
    pub fn ingest_block(
        &self,
        raw: &[u8],
        location: BlockLocation,
        position: (u16, u64),
    ) -> Result<(), ChainError> {
        let block = parse_block(raw)?;
        let updates = self
            .headers
            .write()
            .unwrap()
            .insert(block.header, Some(location));

        for update in updates {
            match update {
                ChainUpdate::Extended { hash, height } => {
                    // The update may refer to an orphan-released header
                    // whose block bytes live elsewhere.
                    let (entry_block, entry_location) = if hash == block.hash() {
                        (block.clone(), location)
                    } else {
                        let loc = self
                            .headers
                            .read()
                            .unwrap()
                            .location_of(&hash)
                            .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
                        (parse_block(&self.reader.read_at(loc)?)?, loc)
                    };
                    self.apply_extension(height, &entry_block, entry_location, position)?;
                }
                ChainUpdate::Reorg {
                    mrca_height,
                    undo,
                    apply,
                } => {
                    self.handle_reorg(mrca_height, &undo, &apply, position)?;
                }
                ChainUpdate::SideChain { hash } | ChainUpdate::Duplicate { hash } => {
                    if let Some(entry) = self.headers.read().unwrap().get(&hash) {
                        self.writer.put_header(&hash, entry)?;
                    }
                }
                ChainUpdate::Orphaned { .. } => {
                    // Held until the parent shows up.
                }
            }
        }
        Ok(())
    }

    fn apply_extension(
        &self,
        height: u32,
        block: &ParsedBlock,
        location: BlockLocation,
        position: (u16, u64),
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        let progress = ProgressRecord {
            top_height: height,
            top_hash: hash,
            file_number: position.0,
            file_offset: position.1,
        };
        self.writer.apply_block(height, block, location, progress)?;

        {
            let mut headers = self.headers.write().unwrap();
            headers.commit_extend(hash)?;
            let entry = headers.get(&hash).cloned();
            drop(headers);
            if let Some(entry) = entry {
                self.writer.put_header(&hash, &entry)?;
            }
        }
        self.status.top_height.store(height, Ordering::Release);
        crate::metrics::TOP_HEIGHT.set(height as i64);

        let mined: HashSet<TxHash> = block.txs.iter().map(|t| t.txid).collect();
        let sweep = self.zc.process_new_block(&mined);
        self.publish_sweep(&sweep);

        if self.status.is_ready() {
            self.publish(Notification::NewBlock {
                top_height: height,
                branch_point: None,
            });
        }
        Ok(())
    }

    fn handle_reorg(
        &self,
        mrca_height: u32,
        undo: &[TxHash],
        apply: &[TxHash],
        position: (u16, u64),
    ) -> Result<(), ChainError> {
        info!(
            mrca_height,
            undo = undo.len(),
            apply = apply.len(),
            "chain reorganization"
        );
        crate::metrics::REORG_COUNT.inc();

        // Collect the bodies on both sides before mutating anything.
        let mut undo_blocks = Vec::with_capacity(undo.len());
        for hash in undo {
            let location = self
                .headers
                .read()
                .unwrap()
                .location_of(hash)
                .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
            undo_blocks.push(parse_block(&self.reader.read_at(location)?)?);
        }
        let mut apply_blocks = Vec::with_capacity(apply.len());
        for hash in apply {
            let (height, location) = {
                let headers = self.headers.read().unwrap();
                let entry = headers
                    .get(hash)
                    .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
                let location = entry
                    .location
                    .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
                (entry.height, location)
            };
            apply_blocks.push((height, location, parse_block(&self.reader.read_at(location)?)?));
        }

        // Undo top-down. Progress regresses one block at a time so a crash
        // mid-reorg resumes consistently.
        for (hash, block) in undo.iter().zip(&undo_blocks) {
            let height = self
                .headers
                .read()
                .unwrap()
                .get(hash)
                .map(|e| e.height)
                .ok_or_else(|| ChainError::MissingParent(hex::encode(hash)))?;
            let prev_height = height - 1;
            let prev_hash = self
                .headers
                .read()
                .unwrap()
                .main_hash_at(prev_height)
                .unwrap_or([0u8; 32]);
            let prev_location = self
                .headers
                .read()
                .unwrap()
                .location_of(&prev_hash)
                .unwrap_or(BlockLocation {
                    file_number: 0,
                    offset: 0,
                    size: 0,
                });
            let progress = ProgressRecord {
                top_height: prev_height,
                top_hash: prev_hash,
                file_number: prev_location.file_number,
                file_offset: prev_location.offset + prev_location.size as u64,
            };
            self.writer.undo_block(height, block, progress)?;
            crate::metrics::BLOCKS_UNDONE.inc();
        }

        // Apply the heavier branch bottom-up.
        for (height, location, block) in &apply_blocks {
            let progress = ProgressRecord {
                top_height: *height,
                top_hash: block.hash(),
                file_number: position.0,
                file_offset: position.1,
            };
            self.writer.apply_block(*height, block, *location, progress)?;
        }

        // Index writer is done; flip the main-branch pointers.
        {
            let mut headers = self.headers.write().unwrap();
            headers.commit_reorg(mrca_height, undo, apply)?;
            for hash in undo.iter().chain(apply.iter()) {
                let entry = headers.get(hash).cloned();
                if let Some(entry) = entry {
                    self.writer.put_header(hash, &entry)?;
                }
            }
        }

        let new_top = mrca_height + apply.len() as u32;
        self.status.top_height.store(new_top, Ordering::Release);
        crate::metrics::TOP_HEIGHT.set(new_top as i64);

        // Rebuild zc state: reinject the undone transactions, then
        // revalidate everything against the new tip.
        let undone_txs: Vec<ParsedTx> = undo_blocks
            .iter()
            .rev() // original chain order: lowest height first
            .flat_map(|b| b.txs.iter().cloned())
            .collect();
        let applied_txids: HashSet<TxHash> = apply_blocks
            .iter()
            .flat_map(|(_, _, b)| b.txs.iter().map(|t| t.txid))
            .collect();
        let (admitted, sweep) = self.zc.reorg(&undone_txs, &applied_txids, unix_now());

        for admission in &admitted {
            if let crate::zeroconf::Admitted::Fresh { txid, touched, .. } = admission {
                if let Some(info) = self.zc.ledger_info_of(txid) {
                    self.publish(Notification::Zc {
                        entries: vec![crate::broadcast::zc_ledger_entry(&info)],
                        scripthashes: touched.clone(),
                        broadcast_id: None,
                    });
                }
            }
        }
        self.publish_sweep(&sweep);

        if self.status.is_ready() {
            self.publish(Notification::NewBlock {
                top_height: new_top,
                branch_point: Some(mrca_height),
            });
        }
        Ok(())
    }

    fn publish_sweep(&self, sweep: &BlockSweep) {
        if !sweep.evicted.is_empty() {
            // Group one InvalidatedZc per originating broadcast so clients
            // can correlate; network-received evictions batch together.
            let mut untagged = Vec::new();
            for eviction in &sweep.evicted {
                match eviction.broadcast_id {
                    Some(id) => self.publish(Notification::InvalidatedZc {
                        tx_hashes: vec![eviction.txid],
                        broadcast_id: Some(id),
                    }),
                    None => untagged.push(eviction.txid),
                }
            }
            if !untagged.is_empty() {
                self.publish(Notification::InvalidatedZc {
                    tx_hashes: untagged,
                    broadcast_id: None,
                });
            }
        }
    }

    /// Blocking scan loop: poll the block files for growth until shutdown.
    pub fn run(&self, poll_interval: Duration) {
        info!(
            network = ?self.config.network,
            threads = self.config.thread_count,
            "chain organizer running"
        );
        while !self.shutdown.load(Ordering::Acquire) {
            match self.initial_scan() {
                Ok(0) => std::thread::sleep(poll_interval),
                Ok(n) => {
                    info!(blocks = n, "ingested new blocks");
                }
                Err(e) => {
                    warn!(error = %e, "scan iteration failed");
                    std::thread::sleep(poll_interval);
                }
            }
        }
        info!("chain organizer stopped");
    }
}
