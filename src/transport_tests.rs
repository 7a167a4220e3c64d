//! Full-stack transport tests: a real websocket listener, the encrypted
//! record layer, fragmentation, request routing and unsolicited pushes.

use std::sync::Arc;
use std::time::Duration;

use crate::block_files::BlockFileReader;
use crate::broadcast::BroadcastManager;
use crate::config::Network;
use crate::db::StoreHandles;
use crate::dispatcher::{Dispatcher, EngineHandles};
use crate::index_writer::IndexWriter;
use crate::node::NodeInterface;
use crate::notifications::{Notification, NotificationBus};
use crate::organizer::ChainStatus;
use crate::queries::QueryEngine;
use crate::sessions::SessionRegistry;
use crate::testutil::{scripthash_for, MockNode, TestChain};
use crate::transport::client::RemoteClient;
use crate::transport::encryption::HandshakeMode;
use crate::transport::peers::{AuthorizedPeers, IdentityKey};
use crate::transport::server::{run_listen_server, ServerContext};
use crate::types::COIN;
use crate::wire::{HistoryView, Reply, Request};
use crate::zeroconf::ZcEngine;

struct TestServer {
    url: String,
    server_public: [u8; 32],
    client_identity: IdentityKey,
    handles: Arc<EngineHandles>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> (TestServer, TestChain) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StoreHandles::open(&dir.path().join("db")).unwrap());
    let writer = IndexWriter::new(store.clone());
    let mut chain = TestChain::new();

    let b0 = chain.mine_to('A');
    writer
        .apply_block(0, &b0, chain.location_at(0), chain.progress_at(0))
        .unwrap();
    let spend = chain.spend(&b0.txs[0], 0, 'B', 50 * COIN);
    let b1 = chain.mine_with(vec![spend]);
    writer
        .apply_block(1, &b1, chain.location_at(1), chain.progress_at(1))
        .unwrap();

    let blocks_dir = dir.path().join("blocks");
    chain.write_blk_file(&blocks_dir, Network::Regtest.magic());
    let reader = Arc::new(BlockFileReader::new(&blocks_dir, Network::Regtest.magic()));

    let config = crate::config::ArmoryConfig::for_directory(dir.path(), Network::Regtest);
    let queries = Arc::new(QueryEngine::new(store.clone(), reader));
    let zc = Arc::new(ZcEngine::new(store));
    let sessions = Arc::new(SessionRegistry::new());
    let bus = Arc::new(NotificationBus::new());
    let node: Arc<dyn NodeInterface> = Arc::new(MockNode::new());
    let broadcaster = Arc::new(BroadcastManager::new(
        zc.clone(),
        sessions.clone(),
        bus.clone(),
        node.clone(),
        Duration::from_secs(30),
    ));
    let chain_status = Arc::new(ChainStatus::new());
    chain_status
        .top_height
        .store(1, std::sync::atomic::Ordering::Release);
    chain_status
        .ready
        .store(true, std::sync::atomic::Ordering::Release);

    let handles = Arc::new(EngineHandles {
        config,
        queries,
        zc,
        sessions,
        bus,
        broadcaster,
        node,
        chain: chain_status,
    });

    let server_identity = IdentityKey::generate();
    let server_public = server_identity.public;
    let client_identity = IdentityKey::generate();
    let mut authorized = AuthorizedPeers::empty();
    authorized.add("test-client", client_identity.public);

    let ctx = Arc::new(ServerContext {
        dispatcher: Arc::new(Dispatcher::new(handles.clone())),
        identity: server_identity,
        authorized,
        rekey_threshold: 1 << 30,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_listen_server(ctx, listener));

    (
        TestServer {
            url: format!("ws://{}", addr),
            server_public,
            client_identity,
            handles,
            _dir: dir,
        },
        chain,
    )
}

#[tokio::test]
async fn test_mutual_session_round_trip() {
    let (server, _chain) = start_server().await;
    let (client, _push) = RemoteClient::connect(
        &server.url,
        &server.client_identity,
        server.server_public,
        HandshakeMode::Mutual,
        1 << 30,
    )
    .await
    .unwrap();

    let reply = client.request(Request::NodeStatus).await.unwrap();
    assert!(matches!(reply, Reply::NodeStatus(_)));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_register_history_and_ready_push() {
    let (server, chain) = start_server().await;
    let (client, mut push) = RemoteClient::connect(
        &server.url,
        &server.client_identity,
        server.server_public,
        HandshakeMode::OneWay,
        1 << 30,
    )
    .await
    .unwrap();

    let reply = client
        .request(Request::Register {
            wallet_id: "w1".into(),
            scripthashes: vec![scripthash_for('B')],
            is_new: false,
        })
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Registered { .. }));

    let reply = client.request(Request::GoOnline).await.unwrap();
    assert_eq!(reply, Reply::GoingOnline);

    // Refresh first, then Ready, per the ordering contract.
    let first = tokio::time::timeout(Duration::from_secs(5), push.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Notification::Refresh { .. }));
    let second = tokio::time::timeout(Duration::from_secs(5), push.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, Notification::Ready { top_height: 1 });

    let reply = client
        .request(Request::HistoryPage {
            view: HistoryView::Wallet("w1".into()),
            page: 0,
        })
        .await
        .unwrap();
    let Reply::HistoryPage { entries } = reply else {
        panic!("unexpected reply");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].tx_hash, chain.blocks[1].txs[1].txid);
}

#[tokio::test]
async fn test_fragmented_batch_round_trip() {
    let (server, _chain) = start_server().await;
    let (client, _push) = RemoteClient::connect(
        &server.url,
        &server.client_identity,
        server.server_public,
        HandshakeMode::OneWay,
        1 << 30,
    )
    .await
    .unwrap();

    // 300 hashes push both request and reply well past one packet.
    let hashes: Vec<Vec<u8>> = (0..300u32)
        .map(|i| {
            let mut hash = [0u8; 32];
            hash[0..4].copy_from_slice(&i.to_le_bytes());
            hash.to_vec()
        })
        .collect();
    let reply = client
        .request(Request::GetTxBatchByHash { hashes })
        .await
        .unwrap();
    let Reply::TxBatch { txs } = reply else {
        panic!("unexpected reply");
    };
    assert_eq!(txs.len(), 300);
    assert!(txs.iter().all(|(_, tx)| tx.is_none()));
}

#[tokio::test]
async fn test_unauthorized_mutual_client_rejected() {
    let (server, _chain) = start_server().await;
    let rogue = IdentityKey::generate();
    let result = RemoteClient::connect(
        &server.url,
        &rogue,
        server.server_public,
        HandshakeMode::Mutual,
        1 << 30,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_session_evicted_on_disconnect() {
    let (server, _chain) = start_server().await;
    let (client, _push) = RemoteClient::connect(
        &server.url,
        &server.client_identity,
        server.server_public,
        HandshakeMode::OneWay,
        1 << 30,
    )
    .await
    .unwrap();

    client.request(Request::GoOnline).await.unwrap();
    assert_eq!(server.handles.sessions.session_count(), 1);

    drop(client);
    // Grace period, then deterministic teardown.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if server.handles.sessions.session_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session should be evicted after disconnect");
}
