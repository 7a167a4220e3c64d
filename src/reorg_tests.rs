//! End-to-end chain scenarios: scan, restart, reorg with zc reinjection,
//! and the incremental outpoint sync primitive, all over real block files
//! and a real store.

use std::sync::Arc;
use std::time::Duration;

use crate::block_files::BlockFileReader;
use crate::broadcast::BroadcastManager;
use crate::config::Network;
use crate::db::{StoreHandles, CF_BLKDATA};
use crate::index_writer::{IndexWriter, InitMode};
use crate::keys;
use crate::notifications::{Notification, NotificationBus};
use crate::organizer::ChainOrganizer;
use crate::parser::parse_block;
use crate::queries::QueryEngine;
use crate::sessions::SessionRegistry;
use crate::testutil::{scripthash_for, MockNode, TestChain, STRONG_BITS};
use crate::types::COIN;
use crate::zeroconf::ZcEngine;

const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

struct Harness {
    organizer: Arc<ChainOrganizer>,
    store: Arc<StoreHandles>,
    zc: Arc<ZcEngine>,
    bus: Arc<NotificationBus>,
    reader: Arc<BlockFileReader>,
}

impl Harness {
    fn open(root: &std::path::Path) -> Harness {
        let config = crate::config::ArmoryConfig::for_directory(root, Network::Regtest);
        let store = Arc::new(StoreHandles::open(&config.db_dir).unwrap());
        let reader = Arc::new(BlockFileReader::new(&root.join("blocks"), MAGIC));
        let bus = Arc::new(NotificationBus::new());
        let zc = Arc::new(ZcEngine::new(store.clone()));
        let organizer = Arc::new(ChainOrganizer::new(
            config,
            store.clone(),
            reader.clone(),
            zc.clone(),
            bus.clone(),
            Arc::new(SessionRegistry::new()),
        ));
        organizer.init(InitMode::Resume).unwrap();
        Harness {
            organizer,
            store,
            zc,
            bus,
            reader,
        }
    }

    fn balance_of(&self, owner: char) -> u64 {
        let queries = QueryEngine::new(self.store.clone(), self.reader.clone());
        queries.ssh(&scripthash_for(owner)).unwrap().confirmed_balance
    }
}

#[test]
fn test_scan_and_restart_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = TestChain::new();
    for owner in ['A', 'B', 'C', 'D', 'E', 'F'] {
        chain.mine_to(owner);
    }
    chain.write_blk_file(&dir.path().join("blocks"), MAGIC);

    {
        let harness = Harness::open(dir.path());
        let ingested = harness.organizer.initial_scan().unwrap();
        assert_eq!(ingested, 6);
        assert_eq!(harness.organizer.top_height(), Some(5));
        assert_eq!(harness.balance_of('A'), 50 * COIN);

        // Block-data integrity: the stored offset deserializes to a block
        // whose hash matches the height index.
        let blkdata: crate::db::BlockDataRecord = harness
            .store
            .get_record(CF_BLKDATA, &keys::blkdata_key(3))
            .unwrap()
            .unwrap();
        let raw = harness.reader.read_at(blkdata.location).unwrap();
        assert_eq!(parse_block(&raw).unwrap().hash(), blkdata.hash);
    }

    // Reload the process: identical balances, identical top.
    let harness = Harness::open(dir.path());
    let ingested = harness.organizer.initial_scan().unwrap();
    assert_eq!(ingested, 0, "resume must not re-ingest committed blocks");
    assert_eq!(harness.organizer.top_height(), Some(5));
    for owner in ['A', 'B', 'C', 'D', 'E', 'F'] {
        assert_eq!(harness.balance_of(owner), 50 * COIN, "balance of {}", owner);
    }
}

#[test]
fn test_reorg_moves_balances_and_invalidates_zc() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = TestChain::new();
    // Heights 0..4: coinbases to A..E.
    for owner in ['A', 'B', 'C', 'D', 'E'] {
        chain.mine_to(owner);
    }
    // Height 5: coinbase to F plus D paying 45 to E.
    let d_coinbase = chain.blocks[3].txs[0].clone();
    let spend_d = chain.spend(&d_coinbase, 0, 'E', 45 * COIN);
    chain.mine_block('F', vec![spend_d.clone()]);
    chain.write_blk_file(&dir.path().join("blocks"), MAGIC);

    let harness = Harness::open(dir.path());
    harness.organizer.initial_scan().unwrap();
    assert_eq!(harness.balance_of('E'), 95 * COIN);
    assert_eq!(harness.balance_of('D'), 0);

    // A zc spending E's height-4 coinbase, soon to be orphaned.
    let e_coinbase = chain.blocks[4].txs[0].clone();
    let zc_e = chain.spend(&e_coinbase, 0, 'F', 49 * COIN);
    harness.zc.admit(&zc_e.raw, None, 100).unwrap();

    let mut bus_rx = harness.bus.subscribe();

    // Alternate branch from height 3 with more work: 4A carries A paying
    // B 20 and C 30, 5A is a plain coinbase.
    let orphaned = chain.fork_at(3);
    assert_eq!(orphaned.len(), 2);
    chain.set_bits(STRONG_BITS);
    let a_coinbase = chain.blocks[0].txs[0].clone();
    let spend_a = chain.spend_many(&[(&a_coinbase, 0)], &[('B', 20 * COIN), ('C', 30 * COIN)], 0xFFFF_FFFF);
    chain.mine_block('G', vec![spend_a]);
    chain.mine_to('H');
    chain.write_blk_file(&dir.path().join("blocks"), MAGIC);

    harness.organizer.initial_scan().unwrap();

    assert_eq!(harness.organizer.top_height(), Some(5));
    assert_eq!(harness.balance_of('A'), 0);
    assert_eq!(harness.balance_of('B'), 70 * COIN);
    assert_eq!(harness.balance_of('C'), 80 * COIN);
    assert_eq!(harness.balance_of('D'), 50 * COIN);
    assert_eq!(harness.balance_of('E'), 0, "orphaned coinbase and payment");
    assert_eq!(harness.balance_of('F'), 0, "orphaned coinbase");
    assert_eq!(harness.balance_of('G'), 50 * COIN);
    assert_eq!(harness.balance_of('H'), 50 * COIN);

    // The zc over the orphaned output is gone; the mined-then-orphaned
    // payment is back in the zc store.
    assert!(!harness.zc.contains(&zc_e.txid));
    assert!(harness.zc.contains(&spend_d.txid));
    let deltas = harness
        .zc
        .deltas_for(&[scripthash_for('D'), scripthash_for('E')]);
    assert_eq!(deltas[&scripthash_for('D')], -(50 * COIN as i64));
    assert_eq!(deltas[&scripthash_for('E')], 45 * COIN as i64);

    // Notifications: an invalidation for the dead zc, a zc event for the
    // reinjection, and a reorg-tagged new block.
    let mut saw_invalidated = false;
    let mut saw_reinjected = false;
    let mut saw_new_block = false;
    while let Ok(notification) = bus_rx.try_recv() {
        match notification {
            Notification::InvalidatedZc { tx_hashes, .. } => {
                if tx_hashes.contains(&zc_e.txid) {
                    saw_invalidated = true;
                }
            }
            Notification::Zc { entries, .. } => {
                if entries.iter().any(|e| e.tx_hash == spend_d.txid) {
                    saw_reinjected = true;
                }
            }
            Notification::NewBlock {
                top_height: 5,
                branch_point: Some(3),
            } => saw_new_block = true,
            _ => {}
        }
    }
    assert!(saw_invalidated, "zc over orphaned output must invalidate");
    assert!(saw_reinjected, "orphaned mined tx must reinject as zc");
    assert!(saw_new_block, "reorg must announce the branch point");
}

#[test]
fn test_outpoint_sync_over_thousand_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StoreHandles::open(&dir.path().join("db")).unwrap());
    let writer = IndexWriter::new(store.clone());
    let mut chain = TestChain::new();

    for height in 0..1000u32 {
        let block = chain.mine_to('B');
        writer
            .apply_block(height, &block, chain.location_at(height), chain.progress_at(height))
            .unwrap();
    }

    let blocks_dir = dir.path().join("blocks");
    chain.write_blk_file(&blocks_dir, MAGIC);
    let reader = Arc::new(BlockFileReader::new(&blocks_dir, MAGIC));
    let queries = QueryEngine::new(store, reader);

    let batch = queries
        .outpoints_for_addresses(&[scripthash_for('B')], 0)
        .unwrap();
    let records = &batch.per_scripthash[0].1;
    assert!(records.len() >= 1000);
    let total: u64 = records.iter().map(|r| r.value).sum();
    assert_eq!(total, 50_000 * COIN);
    assert!(records.iter().all(|r| r.spender.is_none()));
    assert_eq!(batch.next_height_cutoff, 999);

    // Repeating with the returned cutoff yields an empty batch.
    let again = queries
        .outpoints_for_addresses(&[scripthash_for('B')], batch.next_height_cutoff)
        .unwrap();
    assert!(again.per_scripthash[0].1.is_empty());
}

#[tokio::test]
async fn test_two_sessions_one_zc_notification_each() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StoreHandles::open(&dir.path().join("db")).unwrap());
    let writer = IndexWriter::new(store.clone());
    let mut chain = TestChain::new();
    let b0 = chain.mine_to('A');
    writer
        .apply_block(0, &b0, chain.location_at(0), chain.progress_at(0))
        .unwrap();

    let zc = Arc::new(ZcEngine::new(store));
    let sessions = Arc::new(SessionRegistry::new());
    let bus = Arc::new(NotificationBus::new());
    let node = Arc::new(MockNode::new());
    let manager = BroadcastManager::new(
        zc,
        sessions.clone(),
        bus,
        node,
        Duration::from_secs(30),
    );

    // Overlapping registrations across two concurrent sessions.
    let one = sessions.create_session();
    let two = sessions.create_session();
    one.set_online();
    two.set_online();
    sessions.register_wallet(&one, "w1", vec![scripthash_for('A'), scripthash_for('B')]);
    sessions.register_wallet(&two, "w2", vec![scripthash_for('B')]);

    let spend = chain.spend(&b0.txs[0], 0, 'B', 49 * COIN);
    manager.broadcast_zc(&one, vec![spend.raw.clone()]).await;

    let from_one = one.pop().unwrap();
    let from_two = two.pop().unwrap();
    assert!(one.pop().is_none(), "exactly one notification per session");
    assert!(two.pop().is_none(), "exactly one notification per session");

    match (&from_one, &from_two) {
        (
            Notification::Zc {
                scripthashes: a, ..
            },
            Notification::Zc {
                scripthashes: b, ..
            },
        ) => {
            let mut a = a.clone();
            let mut b = b.clone();
            a.sort();
            b.sort();
            assert_eq!(a, b, "identical scripthash touch sets");
        }
        other => panic!("expected zc notifications, got {:?}", other),
    }
}
