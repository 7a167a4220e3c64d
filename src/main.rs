use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use armorydb::block_files::BlockFileReader;
use armorydb::broadcast::BroadcastManager;
use armorydb::config::{ArmoryConfig, CliArgs};
use armorydb::db::{StoreHandles, CF_HISTORY, CF_SSH, CF_STXO, CF_SUBSSH, CF_TXHINTS};
use armorydb::dispatcher::{Dispatcher, EngineHandles};
use armorydb::index_writer::InitMode;
use armorydb::node::{run_status_monitor, NodeInterface, RpcNode};
use armorydb::notifications::NotificationBus;
use armorydb::organizer::ChainOrganizer;
use armorydb::queries::QueryEngine;
use armorydb::sessions::SessionRegistry;
use armorydb::telemetry::{init_tracing, TelemetryConfig};
use armorydb::transport::peers::{AuthorizedPeers, IdentityKey};
use armorydb::transport::server::{run_listen_server, ServerContext};
use armorydb::zeroconf::ZcEngine;

fn init_mode(args: &CliArgs) -> InitMode {
    if args.rebuild {
        InitMode::Rebuild
    } else if args.rescan {
        InitMode::Rescan
    } else if args.rescan_ssh {
        InitMode::RescanSsh
    } else {
        InitMode::Resume
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    init_tracing(TelemetryConfig::default())?;
    armorydb::metrics::register_metrics();

    let config = ArmoryConfig::load(&args)?;
    let mode = init_mode(&args);
    info!(
        network = ?config.network,
        db_mode = ?config.db_mode,
        ?mode,
        db_dir = %config.db_dir.display(),
        "starting armorydb"
    );

    let mut store = StoreHandles::open(&config.db_dir)?;
    match mode {
        InitMode::Rebuild => {
            store.clear_families(&armorydb::db::COLUMN_FAMILIES)?;
        }
        InitMode::Rescan => {
            store.clear_families(&[CF_STXO, CF_SUBSSH, CF_SSH, CF_TXHINTS, CF_HISTORY])?;
        }
        _ => {}
    }
    let store = Arc::new(store);

    let reader = Arc::new(BlockFileReader::new(
        &config.blocks_dir(),
        config.network.magic(),
    ));
    let bus = Arc::new(NotificationBus::new());
    let sessions = Arc::new(SessionRegistry::new());
    let zc = Arc::new(ZcEngine::new(store.clone()));

    let organizer = Arc::new(ChainOrganizer::new(
        config.clone(),
        store.clone(),
        reader.clone(),
        zc.clone(),
        bus.clone(),
        sessions.clone(),
    ));
    organizer.init(mode)?;
    zc.reload_from_store()?;

    let chain_status = organizer.status();
    let node: Arc<dyn NodeInterface> = Arc::new(RpcNode::new(config.clone()));

    // Identity material for the listen transport.
    let identity = IdentityKey::load_or_create(&config.data_dir.join("identity.key"))?;
    let authorized = AuthorizedPeers::load(&config.data_dir.join("authorized_peers"))?;

    // Chain organizer: its own thread, never cancelled mid-commit. A
    // store write failure is fatal by policy.
    let scan_organizer = organizer.clone();
    let organizer_thread = std::thread::Builder::new()
        .name("chain-organizer".into())
        .spawn(move || {
            if let Err(e) = scan_organizer.initial_scan() {
                error!(error = %e, "initial scan failed, shutting down to preserve durability");
                std::process::exit(1);
            }
            scan_organizer.run(Duration::from_secs(1));
        })?;

    // Node status monitor thread.
    let monitor_shutdown = Arc::new(AtomicBool::new(false));
    {
        let node = node.clone();
        let chain_status = chain_status.clone();
        let sessions = sessions.clone();
        let bus = bus.clone();
        let shutdown = monitor_shutdown.clone();
        std::thread::Builder::new()
            .name("node-monitor".into())
            .spawn(move || {
                run_status_monitor(node, chain_status, sessions, bus, Duration::from_secs(10), shutdown)
            })?;
    }

    // Transport and dispatcher on the async runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count)
        .enable_all()
        .build()?;

    let result: Result<(), Box<dyn std::error::Error>> = runtime.block_on(async {
        let queries = Arc::new(QueryEngine::new(store.clone(), reader.clone()));
        let broadcaster = Arc::new(BroadcastManager::new(
            zc.clone(),
            sessions.clone(),
            bus.clone(),
            node.clone(),
            Duration::from_secs(config.broadcast_timeout_secs),
        ));
        let handles = Arc::new(EngineHandles {
            config: config.clone(),
            queries,
            zc: zc.clone(),
            sessions: sessions.clone(),
            bus: bus.clone(),
            broadcaster,
            node: node.clone(),
            chain: chain_status.clone(),
        });
        let ctx = Arc::new(ServerContext {
            dispatcher: Arc::new(Dispatcher::new(handles)),
            identity,
            authorized,
            rekey_threshold: config.rekey_byte_threshold,
        });

        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        run_listen_server(ctx, listener).await?;
        Ok(())
    });

    organizer.request_shutdown();
    monitor_shutdown.store(true, std::sync::atomic::Ordering::Release);
    let _ = organizer_thread.join();
    result
}
