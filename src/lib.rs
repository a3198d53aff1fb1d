//! # quorumkv
//!
//! A replicated, strongly-consistent coordination service:
//! - Leader-based log replication (Raft family) with linearizable reads
//! - Durable binlog + per-user key-value store on RocksDB
//! - Ephemeral client sessions with TTL, advisory locks, one-shot watches
//! - User registration/login replicated through the log
//! - Single-server membership change and snapshot-based log compaction
//! - gRPC for both cluster-internal traffic and client requests
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  Node cluster                  │
//! │   - Leader: accepts writes, confirms reads     │
//! │   - Followers: replicate the binlog            │
//! └───────┬───────────────┬───────────────┬────────┘
//!         │ gRPC          │               │
//!   ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!   │ Node A    │   │ Node B    │   │ Node C    │
//!   │ binlog    │   │ binlog    │   │ binlog    │
//!   │ kv store  │   │ kv store  │   │ kv store  │
//!   │ snapshot  │   │ snapshot  │   │ snapshot  │
//!   └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! quorumkv-node serve \
//!   --id 127.0.0.1:8868 \
//!   --members 127.0.0.1:8868,127.0.0.1:8869,127.0.0.1:8870 \
//!   --data-dir ./data --binlog-dir ./binlog --snapshot-dir ./snapshot
//! ```

pub mod common;
pub mod node;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::Node;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("quorumkv");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
