//! Configuration for a quorumkv node

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node configuration
///
/// Every replica runs with the same cluster bootstrap list; per-node state
/// lives under directories derived from the node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID, `host:port`; also the gRPC bind address
    pub server_id: String,

    /// Cluster bootstrap members, including self (unless quiet mode)
    pub members: Vec<String>,

    /// Data directory (meta + per-user KV stores)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Binlog directory
    #[serde(default = "default_binlog_dir")]
    pub binlog_dir: PathBuf,

    /// Snapshot directory
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Election timeout lower bound (ms)
    #[serde(default = "default_elect_timeout_min")]
    pub elect_timeout_min_ms: u64,

    /// Election timeout upper bound (ms)
    #[serde(default = "default_elect_timeout_max")]
    pub elect_timeout_max_ms: u64,

    /// Session lease length (microseconds)
    #[serde(default = "default_session_expire_timeout")]
    pub session_expire_timeout_us: i64,

    /// Max entries per AppendEntries batch
    #[serde(default = "default_log_rep_batch_max")]
    pub log_rep_batch_max: i64,

    /// Max client acks pending before Put is refused
    #[serde(default = "default_max_write_pending")]
    pub max_write_pending: usize,

    /// Max committed-but-unapplied entries before followers report busy
    #[serde(default = "default_max_commit_pending")]
    pub max_commit_pending: i64,

    /// Log gap under which a joining node counts as caught up
    #[serde(default = "default_min_log_gap")]
    pub min_log_gap: i64,

    /// Delay before retrying a failed/busy replication RPC (ms)
    #[serde(default = "default_replication_retry_timespan")]
    pub replication_retry_timespan_ms: u64,

    /// Binlog compaction sweep interval (seconds)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Deadline for a joining node to catch up (seconds)
    #[serde(default = "default_add_new_node_timeout")]
    pub add_new_node_timeout_secs: u64,

    /// Enable periodic binlog compaction
    #[serde(default = "default_true")]
    pub enable_log_compaction: bool,

    /// Enable periodic snapshots
    #[serde(default)]
    pub enable_snapshot: bool,

    /// Snapshot write interval (seconds)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Max payload per InstallSnapshot packet (bytes)
    #[serde(default = "default_max_snapshot_request_size")]
    pub max_snapshot_request_size: usize,

    /// Quiet mode: not a cluster member until a committed AddNode names us
    #[serde(default)]
    pub quiet: bool,

    /// Fraction of client RPCs traced to the access log
    #[serde(default = "default_trace_sample_ratio")]
    pub trace_sample_ratio: f64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_binlog_dir() -> PathBuf {
    PathBuf::from("./binlog")
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./snapshot")
}
fn default_elect_timeout_min() -> u64 {
    150
}
fn default_elect_timeout_max() -> u64 {
    300
}
fn default_session_expire_timeout() -> i64 {
    6_000_000
}
fn default_log_rep_batch_max() -> i64 {
    500
}
fn default_max_write_pending() -> usize {
    10_000
}
fn default_max_commit_pending() -> i64 {
    10_000
}
fn default_min_log_gap() -> i64 {
    5
}
fn default_replication_retry_timespan() -> u64 {
    2_000
}
fn default_gc_interval() -> u64 {
    60
}
fn default_add_new_node_timeout() -> u64 {
    60
}
fn default_snapshot_interval() -> u64 {
    600
}
fn default_max_snapshot_request_size() -> usize {
    1 << 20
}
fn default_trace_sample_ratio() -> f64 {
    0.001
}
fn default_true() -> bool {
    true
}

impl Config {
    /// A config with defaults for everything but identity and membership.
    pub fn new(server_id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            server_id: server_id.into(),
            members,
            data_dir: default_data_dir(),
            binlog_dir: default_binlog_dir(),
            snapshot_dir: default_snapshot_dir(),
            elect_timeout_min_ms: default_elect_timeout_min(),
            elect_timeout_max_ms: default_elect_timeout_max(),
            session_expire_timeout_us: default_session_expire_timeout(),
            log_rep_batch_max: default_log_rep_batch_max(),
            max_write_pending: default_max_write_pending(),
            max_commit_pending: default_max_commit_pending(),
            min_log_gap: default_min_log_gap(),
            replication_retry_timespan_ms: default_replication_retry_timespan(),
            gc_interval_secs: default_gc_interval(),
            add_new_node_timeout_secs: default_add_new_node_timeout(),
            enable_log_compaction: true,
            enable_snapshot: false,
            snapshot_interval_secs: default_snapshot_interval(),
            max_snapshot_request_size: default_max_snapshot_request_size(),
            quiet: false,
            trace_sample_ratio: default_trace_sample_ratio(),
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server_id.is_empty() {
            return Err(crate::Error::InvalidConfig("server_id is required".into()));
        }
        if self.members.is_empty() && !self.quiet {
            return Err(crate::Error::InvalidConfig(
                "cluster members are required".into(),
            ));
        }
        if !self.quiet && !self.members.iter().any(|m| m == &self.server_id) {
            return Err(crate::Error::InvalidConfig(format!(
                "this node is not in cluster membership: {}",
                self.server_id
            )));
        }
        if self.elect_timeout_min_ms == 0 || self.elect_timeout_max_ms < self.elect_timeout_min_ms
        {
            return Err(crate::Error::InvalidConfig(
                "election timeout range is invalid".into(),
            ));
        }
        Ok(())
    }

    /// Per-node subdirectory name, id with `:` replaced for the filesystem.
    pub fn sub_dir(&self) -> String {
        self.server_id.replace(':', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validate() {
        let cfg = Config::new("127.0.0.1:8868", vec!["127.0.0.1:8868".to_string()]);
        assert_eq!(cfg.elect_timeout_min_ms, 150);
        assert_eq!(cfg.session_expire_timeout_us, 6_000_000);
        assert!(cfg.enable_log_compaction);
        assert!(!cfg.enable_snapshot);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_outsider() {
        let cfg = Config::new("127.0.0.1:1", vec!["127.0.0.1:2".to_string()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_quiet_node_may_be_outside_membership() {
        let mut cfg = Config::new("127.0.0.1:1", vec!["127.0.0.1:2".to_string()]);
        cfg.quiet = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_sub_dir_replaces_colon() {
        let cfg = Config::new("127.0.0.1:8868", vec!["127.0.0.1:8868".to_string()]);
        assert_eq!(cfg.sub_dir(), "127.0.0.1_8868");
    }
}
