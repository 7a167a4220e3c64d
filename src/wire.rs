/// Wire Protocol Payloads
///
/// Serialized requests, replies and notifications carried inside transport
/// frames. Every payload travels in a versioned envelope; the server
/// rejects anything below its floor with `UnsupportedVersion`. Encoding is
/// bincode over these serde types, stable as long as field order holds.

use serde::{Deserialize, Serialize};

use crate::error::{BroadcastError, ChainError, EngineError, InputError, TransportError, ZcError};
use crate::ledger::LedgerEntry;
use crate::notifications::{NodeStatusInfo, Notification};
use crate::queries::{OutpointBatch, RawTxRecord, Spentness, Utxo};
use crate::types::{BalanceTriple, BroadcastId, ScriptHash, TxHash};
use crate::zeroconf::ZcSpentness;

pub const PROTOCOL_VERSION: u16 = 1;
pub const VERSION_FLOOR: u16 = 1;

/// Message id reserved for unsolicited server pushes.
pub const UNSOLICITED_ID: u64 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub body: T,
}

/// Which ledger the caller wants to page through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryView {
    Wallet(String),
    All,
    Address(ScriptHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeEstimateMode {
    Conservative,
    Economical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Register {
        wallet_id: String,
        scripthashes: Vec<ScriptHash>,
        is_new: bool,
    },
    Unregister {
        wallet_id: Option<String>,
        scripthashes: Vec<ScriptHash>,
    },
    GoOnline,
    HistoryPage {
        view: HistoryView,
        page: u32,
    },
    GetCombinedBalances {
        wallet_ids: Vec<String>,
    },
    GetCombinedTxnCounts {
        wallet_ids: Vec<String>,
    },
    GetUtxos {
        view: HistoryView,
        min_value: Option<u64>,
    },
    GetOutpointsForAddresses {
        scripthashes: Vec<ScriptHash>,
        height_cutoff: u32,
        zc_cutoff: u64,
    },
    GetSpentness {
        outpoints: Vec<(Vec<u8>, Vec<u32>)>,
    },
    GetZcSpentness {
        outpoints: Vec<(Vec<u8>, Vec<u32>)>,
    },
    GetTxByHash {
        hash: Vec<u8>,
    },
    GetTxBatchByHash {
        hashes: Vec<Vec<u8>>,
    },
    GetHeaderByHash {
        hash: Vec<u8>,
    },
    GetHeaderByHeight {
        height: u32,
    },
    BroadcastZc {
        raw_txs: Vec<Vec<u8>>,
    },
    BroadcastThroughRpc {
        raw_tx: Vec<u8>,
    },
    NodeStatus,
    EstimateFee {
        n_blocks: u32,
        mode: FeeEstimateMode,
    },
    FeeSchedule {
        mode: FeeEstimateMode,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalances {
    pub wallet_id: String,
    pub rollup: BalanceTriple,
    /// Only addresses whose version moved past the session's last seen
    /// value, plus that new version.
    pub addresses: Vec<(ScriptHash, BalanceTriple, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTxnCounts {
    pub wallet_id: String,
    pub total: u64,
    pub addresses: Vec<(ScriptHash, u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Registered {
        refresh_id: String,
    },
    Unregistered,
    GoingOnline,
    HistoryPage {
        entries: Vec<LedgerEntry>,
    },
    CombinedBalances {
        wallets: Vec<WalletBalances>,
    },
    CombinedTxnCounts {
        wallets: Vec<WalletTxnCounts>,
    },
    Utxos {
        utxos: Vec<Utxo>,
    },
    Outpoints(OutpointBatch),
    Spentness {
        results: Vec<(Vec<u8>, Vec<(u32, Spentness)>)>,
    },
    ZcSpentness {
        results: Vec<(Vec<u8>, Vec<(u32, ZcSpentness)>)>,
    },
    Tx {
        tx: Option<RawTxRecord>,
    },
    TxBatch {
        txs: Vec<(TxHash, Option<RawTxRecord>)>,
    },
    Header {
        raw_header: Option<Vec<u8>>,
        height: Option<u32>,
    },
    Broadcast {
        broadcast_id: BroadcastId,
    },
    NodeStatus(NodeStatusInfo),
    FeeEstimate {
        feerate_sat_per_kb: u64,
        blocks: u32,
    },
    FeeSchedule {
        entries: Vec<(u32, u64)>,
    },
    Error(WireError),
}

/// Either side of the framed stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Request(Request),
    Reply(Reply),
    Notification(Notification),
}

pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        body: payload.clone(),
    };
    // Serialization of in-memory payloads only fails on resource
    // exhaustion; surface it as an empty frame the peer rejects.
    bincode::serialize(&envelope).unwrap_or_default()
}

pub fn decode_payload(bytes: &[u8]) -> Result<Payload, InputError> {
    let envelope: Envelope<Payload> = bincode::deserialize(bytes)
        .map_err(|e| InputError::MalformedRequest(e.to_string()))?;
    if envelope.version < VERSION_FLOOR {
        return Err(InputError::UnsupportedVersion {
            got: envelope.version,
            floor: VERSION_FLOOR,
        });
    }
    Ok(envelope.body)
}

/// Stable error codes carried in replies and Error notifications.
pub fn error_code(error: &EngineError) -> u32 {
    match error {
        EngineError::Input(e) => match e {
            InputError::MalformedRequest(_) => 100,
            InputError::UnsupportedVersion { .. } => 101,
            InputError::UnknownWallet(_) => 102,
            InputError::UnknownScripthash => 103,
        },
        EngineError::Chain(e) => match e {
            ChainError::MalformedBlock(_) => 200,
            ChainError::MissingParent(_) => 201,
            ChainError::StoreIO(_) => 202,
            ChainError::CommitFailed(_) => 203,
            ChainError::SchemaMismatch { .. } => 204,
        },
        EngineError::Zc(e) => match e {
            ZcError::AlreadySpentOnChain => 300,
            ZcError::UnknownParent => 301,
            ZcError::ScriptInvalid(_) => 302,
            ZcError::ReplacementRejected(_) => 303,
            ZcError::DoubleSpent(_) => 304,
            ZcError::Expired => 305,
            ZcError::ReorgInvalidated => 306,
            ZcError::Replaced => 307,
        },
        EngineError::Transport(e) => match e {
            TransportError::HandshakeFailed(_) => 400,
            TransportError::AuthRejected => 401,
            TransportError::SequenceOutOfOrder => 402,
            TransportError::FrameViolation(_) => 403,
            TransportError::ConnectionLost => 404,
        },
        EngineError::Broadcast(e) => match e {
            BroadcastError::PeerUnreachable => 500,
            BroadcastError::RpcUnreachable => 501,
            BroadcastError::RpcRejected(_) => 502,
        },
    }
}

pub fn error_reply(error: &EngineError) -> Reply {
    Reply::Error(WireError {
        code: error_code(error),
        message: error.to_string(),
    })
}
