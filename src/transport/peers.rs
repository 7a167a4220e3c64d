/// Peer Identity Material
///
/// Per-installation long-term X25519 identity key plus the authorized
/// peers file: named public keys this installation will accept in mutual
/// handshakes. Saves go through a temp file rename so a crash never leaves
/// a torn peers file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ChainError;

pub struct IdentityKey {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl IdentityKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Load the installation key, creating one on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, ChainError> {
        if path.exists() {
            let raw = std::fs::read(path)?;
            if raw.len() != 32 {
                return Err(ChainError::StoreIO(format!(
                    "identity key file {} has {} bytes, expected 32",
                    path.display(),
                    raw.len()
                )));
            }
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&raw);
            return Ok(Self::from_bytes(bytes));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = Self::generate();
        std::fs::write(path, key.secret.to_bytes())?;
        info!(path = %path.display(), "generated installation identity key");
        Ok(key)
    }

    pub fn secret_clone(&self) -> StaticSecret {
        self.secret.clone()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeersFile {
    peers: HashMap<String, [u8; 32]>,
}

/// Pre-authorized identity keys by peer name.
pub struct AuthorizedPeers {
    peers: HashMap<String, [u8; 32]>,
    path: Option<PathBuf>,
}

impl AuthorizedPeers {
    pub fn empty() -> Self {
        Self {
            peers: HashMap::new(),
            path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let peers = if path.exists() {
            let raw = std::fs::read(path)?;
            let file: PeersFile =
                bincode::deserialize(&raw).map_err(|e| ChainError::StoreIO(e.to_string()))?;
            file.peers
        } else {
            HashMap::new()
        };
        Ok(Self {
            peers,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<(), ChainError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PeersFile {
            peers: self.peers.clone(),
        };
        let raw = bincode::serialize(&file).map_err(|e| ChainError::StoreIO(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn add(&mut self, name: &str, public_key: [u8; 32]) {
        self.peers.insert(name.to_string(), public_key);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.peers.remove(name).is_some()
    }

    pub fn is_authorized(&self, public_key: &[u8; 32]) -> bool {
        self.peers.values().any(|k| k == public_key)
    }

    pub fn key_of(&self, name: &str) -> Option<[u8; 32]> {
        self.peers.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
