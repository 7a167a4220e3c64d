/// Engine Error Taxonomy
///
/// Every fallible path in the engine returns one of these. Batch APIs report
/// per-item outcomes instead of failing wholesale; the only fatal case is a
/// store write failure, which the caller escalates to process exit.

use thiserror::Error;

/// Request-shape errors, surfaced as replies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unsupported protocol version {got}, floor is {floor}")]
    UnsupportedVersion { got: u16, floor: u16 },
    #[error("unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("unknown scripthash")]
    UnknownScripthash,
}

/// Chain and index errors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("malformed block: {0}")]
    MalformedBlock(String),
    #[error("missing parent header {0}")]
    MissingParent(String),
    #[error("store io: {0}")]
    StoreIO(String),
    #[error("batch commit failed: {0}")]
    CommitFailed(String),
    #[error("schema mismatch: db carries version {found}, engine expects {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

/// Zero-confirmation admission errors. These never terminate a connection;
/// they travel back as replies or Error notifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZcError {
    #[error("outpoint already spent on the main branch")]
    AlreadySpentOnChain,
    #[error("input parent is neither on chain nor in the zc store")]
    UnknownParent,
    #[error("script evaluation failed: {0}")]
    ScriptInvalid(String),
    #[error("replacement rejected: {0}")]
    ReplacementRejected(String),
    #[error("replaced by a higher-fee transaction")]
    Replaced,
    #[error("double spent by {0}")]
    DoubleSpent(String),
    #[error("expired from the zc store")]
    Expired,
    #[error("invalidated by reorg")]
    ReorgInvalidated,
}

/// Transport failures. All of these terminate the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer identity rejected")]
    AuthRejected,
    #[error("aead sequence out of order")]
    SequenceOutOfOrder,
    #[error("framing violation: {0}")]
    FrameViolation(String),
    #[error("connection lost")]
    ConnectionLost,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("peer node unreachable")]
    PeerUnreachable,
    #[error("rpc node unreachable")]
    RpcUnreachable,
    #[error("rpc rejected transaction: {0}")]
    RpcRejected(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Zc(#[from] ZcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

impl From<rocksdb::Error> for ChainError {
    fn from(e: rocksdb::Error) -> Self {
        ChainError::StoreIO(e.to_string())
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Chain(ChainError::StoreIO(e.to_string()))
    }
}

impl From<std::io::Error> for ChainError {
    fn from(e: std::io::Error) -> Self {
        ChainError::StoreIO(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
