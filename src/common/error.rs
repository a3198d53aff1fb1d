//! Error types for quorumkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Unknown user sub-store: {0}")]
    UnknownUser(String),

    #[error("Log slot {0} has been compacted away")]
    LogGap(i64),

    #[error("Log slot {0} does not exist yet")]
    LogBeyondEnd(i64),

    // === Consensus Errors ===
    // Client RPCs carry these in-band (success/leader_id/uuid_expired
    // response fields), so no gRPC status mapping exists for them.
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Leader unknown (election in progress)")]
    LeaderUnknown,

    #[error("Leader is still in safe mode")]
    SafeMode,

    #[error("Too many committed entries pending apply")]
    BusyCommitPending,

    #[error("Too many client writes pending")]
    WritePendingFull,

    #[error("Lock is held by another live session")]
    LockUnavailable,

    #[error("Login uuid expired or unknown")]
    UuidExpired,

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}
