/// Engine Configuration
///
/// Everything is resolved once at startup into an immutable `ArmoryConfig`
/// and threaded through components as an `Arc` handle. Precedence:
/// built-in defaults < config file < `ARMORYDB_*` env vars < CLI flags.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(s: &str) -> Option<Network> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    /// Network magic prefixing every block in the blk files.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn node_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    pub fn rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Regtest => 18443,
        }
    }

    pub fn listen_port(&self) -> u16 {
        match self {
            Network::Mainnet => 9001,
            Network::Testnet => 19001,
            Network::Regtest => 19002,
        }
    }
}

/// How much derived state the index keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbMode {
    /// Headers and registered scripthashes only.
    Bare,
    /// Full txhint and stxo coverage for registered scripthashes.
    Full,
    /// Every scripthash ever seen, address queries without registration scan.
    Super,
}

impl DbMode {
    pub fn parse(s: &str) -> Option<DbMode> {
        match s.to_ascii_lowercase().as_str() {
            "bare" => Some(DbMode::Bare),
            "full" => Some(DbMode::Full),
            "super" => Some(DbMode::Super),
            _ => None,
        }
    }
}

/// Credentials for the local bitcoin node's RPC interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAuth {
    Credentials { user: String, pass: String },
    /// `.cookie` file the node writes into its data directory.
    CookieFile(PathBuf),
}

impl NodeAuth {
    /// Resolve to a (user, pass) pair, reading the cookie file if needed.
    pub fn resolve(&self) -> Result<(String, String), ChainError> {
        match self {
            NodeAuth::Credentials { user, pass } => Ok((user.clone(), pass.clone())),
            NodeAuth::CookieFile(path) => {
                let raw = std::fs::read_to_string(path)?;
                let mut parts = raw.trim_end().splitn(2, ':');
                let user = parts.next().unwrap_or_default().to_string();
                let pass = parts
                    .next()
                    .ok_or_else(|| {
                        ChainError::StoreIO(format!("cookie file {} has no ':'", path.display()))
                    })?
                    .to_string();
                Ok((user, pass))
            }
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "armorydb", about = "Bitcoin full-index storage and wallet-service engine")]
pub struct CliArgs {
    /// Path to the config file
    #[arg(long, default_value = "armorydb.toml")]
    pub config: String,

    /// Engine data directory (identity keys, authorized peers)
    #[arg(long)]
    pub datadir: Option<String>,

    /// Index database directory
    #[arg(long)]
    pub dbdir: Option<String>,

    /// Bitcoin node data directory (blk files, cookie)
    #[arg(long)]
    pub satoshi_datadir: Option<String>,

    /// mainnet | testnet | regtest
    #[arg(long)]
    pub network: Option<String>,

    /// bare | full | super
    #[arg(long)]
    pub db_mode: Option<String>,

    /// Worker threads for scan and validation
    #[arg(long)]
    pub threads: Option<usize>,

    /// Listen port for wallet clients
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Discard the whole index and rebuild from the block files
    #[arg(long)]
    pub rebuild: bool,

    /// Keep headers, rebuild all block-derived state
    #[arg(long)]
    pub rescan: bool,

    /// Rebuild only the scripthash rollups from subssh
    #[arg(long)]
    pub rescan_ssh: bool,
}

#[derive(Debug, Clone)]
pub struct ArmoryConfig {
    pub network: Network,
    pub db_mode: DbMode,
    /// Engine home: identity key, authorized peers, logs.
    pub data_dir: PathBuf,
    /// Rocksdb directory.
    pub db_dir: PathBuf,
    /// Node data dir; `blocks/` underneath holds the blk files.
    pub satoshi_data_dir: PathBuf,
    pub thread_count: usize,
    pub listen_port: u16,
    pub rpc_port: u16,
    pub node_auth: NodeAuth,
    /// Bytes through one AEAD direction before a rekey is forced.
    pub rekey_byte_threshold: u64,
    /// Seconds to wait for the node to echo a pushed tx before RPC fallback.
    pub broadcast_timeout_secs: u64,
}

impl ArmoryConfig {
    /// Resolve the full configuration from CLI args, file and environment.
    pub fn load(args: &CliArgs) -> Result<Arc<ArmoryConfig>, EngineError> {
        let mut builder = Config::builder()
            .set_default("network", "mainnet")
            .and_then(|b| b.set_default("db_mode", "super"))
            .and_then(|b| b.set_default("datadir", "~/.armorydb"))
            .and_then(|b| b.set_default("satoshi_datadir", "~/.bitcoin"))
            .and_then(|b| b.set_default("threads", 0i64))
            .and_then(|b| b.set_default("rekey_byte_threshold", 1_073_741_824i64))
            .and_then(|b| b.set_default("broadcast_timeout_secs", 30i64))
            .map_err(|e| ChainError::StoreIO(e.to_string()))?;

        if std::path::Path::new(&args.config).exists() {
            builder = builder.add_source(config::File::with_name(&args.config));
        }
        builder = builder.add_source(config::Environment::with_prefix("ARMORYDB"));

        let file = builder
            .build()
            .map_err(|e| ChainError::StoreIO(e.to_string()))?;

        let get = |cli: &Option<String>, key: &str| -> Option<String> {
            cli.clone().or_else(|| file.get_string(key).ok())
        };

        let network_str = get(&args.network, "network").unwrap_or_else(|| "mainnet".into());
        let network = Network::parse(&network_str).ok_or_else(|| {
            EngineError::Chain(ChainError::StoreIO(format!("bad network '{}'", network_str)))
        })?;

        let mode_str = get(&args.db_mode, "db_mode").unwrap_or_else(|| "super".into());
        let db_mode = DbMode::parse(&mode_str).ok_or_else(|| {
            EngineError::Chain(ChainError::StoreIO(format!("bad db_mode '{}'", mode_str)))
        })?;

        let data_dir = expand(&get(&args.datadir, "datadir").unwrap_or_else(|| "~/.armorydb".into()));
        let db_dir = match get(&args.dbdir, "dbdir") {
            Some(d) => expand(&d),
            None => data_dir.join("databases"),
        };
        let satoshi_data_dir = expand(
            &get(&args.satoshi_datadir, "satoshi_datadir").unwrap_or_else(|| "~/.bitcoin".into()),
        );

        let thread_count = args
            .threads
            .or_else(|| file.get_int("threads").ok().map(|v| v as usize))
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));

        let listen_port = args
            .listen_port
            .or_else(|| file.get_int("listen_port").ok().map(|v| v as u16))
            .unwrap_or_else(|| network.listen_port());

        let rpc_port = file
            .get_int("rpc_port")
            .ok()
            .map(|v| v as u16)
            .unwrap_or_else(|| network.rpc_port());

        let node_auth = match (file.get_string("rpc_user").ok(), file.get_string("rpc_pass").ok()) {
            (Some(user), Some(pass)) => NodeAuth::Credentials { user, pass },
            _ => NodeAuth::CookieFile(satoshi_data_dir.join(".cookie")),
        };

        let rekey_byte_threshold = file.get_int("rekey_byte_threshold").unwrap_or(1 << 30) as u64;
        let broadcast_timeout_secs = file.get_int("broadcast_timeout_secs").unwrap_or(30) as u64;

        Ok(Arc::new(ArmoryConfig {
            network,
            db_mode,
            data_dir,
            db_dir,
            satoshi_data_dir,
            thread_count,
            listen_port,
            rpc_port,
            node_auth,
            rekey_byte_threshold,
            broadcast_timeout_secs,
        }))
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.satoshi_data_dir.join("blocks")
    }

    /// A handle suitable for tests: everything under one scratch directory.
    pub fn for_directory(root: &std::path::Path, network: Network) -> Arc<ArmoryConfig> {
        Arc::new(ArmoryConfig {
            network,
            db_mode: DbMode::Super,
            data_dir: root.to_path_buf(),
            db_dir: root.join("databases"),
            satoshi_data_dir: root.join("satoshi"),
            thread_count: 2,
            listen_port: network.listen_port(),
            rpc_port: network.rpc_port(),
            node_auth: NodeAuth::Credentials {
                user: "user".into(),
                pass: "pass".into(),
            },
            rekey_byte_threshold: 1 << 30,
            broadcast_timeout_secs: 30,
        })
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_network_ports() {
        assert_eq!(Network::Mainnet.node_port(), 8333);
        assert_eq!(Network::Testnet.rpc_port(), 18332);
        assert_eq!(Network::Regtest.listen_port(), 19002);
    }

    #[test]
    fn test_cookie_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = dir.path().join(".cookie");
        let mut f = std::fs::File::create(&cookie).unwrap();
        write!(f, "__cookie__:hunter2\n").unwrap();

        let auth = NodeAuth::CookieFile(cookie);
        let (user, pass) = auth.resolve().unwrap();
        assert_eq!(user, "__cookie__");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn test_cookie_missing_separator() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = dir.path().join(".cookie");
        std::fs::write(&cookie, "nocolon").unwrap();
        assert!(NodeAuth::CookieFile(cookie).resolve().is_err());
    }

    #[test]
    fn test_defaults_from_empty_args() {
        let args = CliArgs {
            config: "/nonexistent/armorydb.toml".into(),
            ..Default::default()
        };
        let cfg = ArmoryConfig::load(&args).unwrap();
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.db_mode, DbMode::Super);
        assert_eq!(cfg.listen_port, 9001);
    }
}
