use std::fmt;

use serde::{Deserialize, Serialize};

/// 32-byte transaction or block hash, internal (little-endian) byte order.
pub type TxHash = [u8; 32];

/// Index key for address-like queries: the output script bytes or their
/// 20/32-byte hash, as produced by `script::scripthash_of`.
pub type ScriptHash = Vec<u8>;

/// 6-byte tag correlating a client push with downstream notifications.
pub type BroadcastId = [u8; 6];

pub const ZERO_HASH: TxHash = [0u8; 32];

/// Display-order hex for a hash (reversed, the way block explorers print it).
pub struct DisplayHash<'a>(pub &'a [u8; 32]);

impl fmt::Display for DisplayHash<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: TxHash,
    pub index: u32,
}

impl Outpoint {
    pub fn new(txid: TxHash, index: u32) -> Self {
        Self { txid, index }
    }
}

/// Where a block sits in the blk*.dat set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub file_number: u16,
    pub offset: u64,
    pub size: u32,
}

/// On-chain coordinates of a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPosition {
    pub height: u32,
    pub tx_index: u16,
}

/// Running rollup for one scripthash. `unconfirmed_balance` is the confirmed
/// figure plus staged zc deltas; only the confirmed parts persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTriple {
    pub confirmed_balance: u64,
    pub unconfirmed_balance: u64,
    pub total_received: u64,
}

pub const COIN: u64 = 100_000_000;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
