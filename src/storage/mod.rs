//! Durable containers: binlog, term/vote meta, per-user KV store, snapshots

pub mod binlog;
pub mod meta;
pub mod snapshot;
pub mod store;

pub use binlog::{BinLogger, LogEntry, LogOp};
pub use meta::Meta;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use store::{DataStore, ValueTag, ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX};
