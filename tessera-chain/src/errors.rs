//! Error types for the chain engine

use thiserror::Error;

/// Convenience alias used across the crate.
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors surfaced by the chain engine, its durable store and the
/// allocation control plane.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A replayed block references a parent absent from the index.
    #[error("parent block not found")]
    ParentNotFound,

    /// A pushed block's parent hash does not match the current head.
    #[error("parent hash does not match the current head")]
    ParentNotMatch,

    /// The merkle root does not cover the block's transactions.
    #[error("merkle root does not match the block transactions")]
    InvalidMerkleRoot,

    /// The block hash does not match the header bytes.
    #[error("block hash does not match the header")]
    InvalidHash,

    /// The producer signature over the block hash does not verify.
    #[error("block signature verification failed")]
    BlockSignatureInvalid,

    /// No block at the requested height on the local chain.
    #[error("no such block")]
    NoSuchBlock,

    /// The database id is not present in the service map.
    #[error("no such database")]
    NoSuchDatabase,

    /// Node allocation exhausted its rounds without enough candidates.
    #[error("database allocation failed")]
    DbAllocation,

    /// A required node metric has not been collected.
    #[error("metric not collected")]
    MetricNotCollected,

    /// A transaction carries an out-of-sequence nonce.
    #[error("transaction nonce mismatch: expected {expected}, got {got}")]
    TxNonceMismatch { expected: u64, got: u64 },

    /// A transaction signature does not verify.
    #[error("transaction signature verification failed")]
    TxSignatureInvalid,

    /// A signed request (envelope, billing request, service header) does
    /// not verify.
    #[error("request signature verification failed")]
    RequestSignatureInvalid,

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] sled::Error),

    /// Serialization failure.
    #[error("encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    /// Key material failure.
    #[error("bad key material: {0}")]
    Key(#[from] ed25519_dalek::SignatureError),

    /// I/O failure outside the store.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound or inbound RPC failure.
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// Unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
