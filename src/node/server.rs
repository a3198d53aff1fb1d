//! Node construction, startup, and lifecycle loops

use crate::common::{get_micros, Config, Error, Result};
use crate::node::client::PeerClients;
use crate::node::perf::PerfCounter;
use crate::node::session::SessionTable;
use crate::node::snapshot::SnapshotState;
use crate::node::state::{Core, NodeRole};
use crate::node::users::UserManager;
use crate::node::watch::WatchTable;
use crate::proto::{self, ShowStatusResponse};
use crate::storage::{BinLogger, DataStore, LogEntry, LogOp, Meta, SnapshotStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Interval between session sweeps
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// One replica of the coordination service.
///
/// Lock order, outermost first: append serializer, snapshot-exclusion lock,
/// core mutex, binlog, then the leaf tables (sessions, session locks,
/// watches). The core mutex is never held across an RPC send.
pub struct Node {
    pub(crate) cfg: Config,
    pub(crate) self_id: String,
    pub(crate) server_start_us: i64,
    pub(crate) core: Mutex<Core>,
    pub(crate) binlog: Mutex<BinLogger>,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) data_store: DataStore,
    pub(crate) users: UserManager,
    pub(crate) snapshot: Mutex<SnapshotState>,
    pub(crate) sessions: Mutex<SessionTable>,
    pub(crate) session_locks: Mutex<HashMap<String, HashSet<String>>>,
    pub(crate) watches: Mutex<WatchTable>,
    pub(crate) perf: PerfCounter,
    pub(crate) peers: PeerClients,
    /// Wakes the apply loop when the commit index grows
    pub(crate) commit_notify: Notify,
    /// Wakes per-peer replicators when the log grows
    pub(crate) replication_notify: Notify,
    /// Interrupts the periodic loops so shutdown is prompt
    pub(crate) shutdown_notify: Notify,
    /// Serializes follower-side AppendEntries bodies
    pub(crate) append_serial: Mutex<()>,
    pub(crate) election_started: AtomicBool,
    /// Invalidates stale membership-change timeout tasks
    pub(crate) mc_generation: AtomicU64,
}

impl Node {
    /// Open all durable state and build the replica. Background loops are
    /// not running until [`Node::start`].
    pub fn new(cfg: Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        let self_id = cfg.server_id.clone();
        let sub_dir = cfg.sub_dir();

        let mut members = Vec::new();
        for member in &cfg.members {
            if member == &self_id && cfg.quiet {
                // quiet mode: not a counted member until a committed
                // AddNode names us
                continue;
            }
            if member == &self_id {
                tracing::info!("cluster member[self]: {}", member);
            } else {
                tracing::info!("cluster member: {}", member);
            }
            members.push(member.clone());
        }

        let meta = Meta::open(cfg.data_dir.join(&sub_dir).join("meta"))?;
        let binlog = BinLogger::open(cfg.binlog_dir.join(&sub_dir))?;
        let data_store = DataStore::open(cfg.data_dir.join(&sub_dir).join("store"))?;
        let users = UserManager::open(cfg.data_dir.join(&sub_dir).join("users"))?;
        let snapshot_store = SnapshotStore::open(cfg.snapshot_dir.join(&sub_dir))?;

        let mut core = Core::new(members, cfg.quiet);
        core.current_term = meta.read_current_term()?;
        core.voted_for = meta.read_voted_for()?;
        core.last_applied = data_store.read_last_applied()?;
        tracing::info!(
            "node {} starting at term {}, last_applied {}",
            self_id,
            core.current_term,
            core.last_applied
        );

        let enable_snapshot = cfg.enable_snapshot;
        let node = Arc::new(Self {
            server_start_us: get_micros(),
            self_id,
            cfg,
            core: Mutex::new(core),
            binlog: Mutex::new(binlog),
            meta: Mutex::new(meta),
            data_store,
            users,
            snapshot: Mutex::new(SnapshotState::new(snapshot_store)),
            sessions: Mutex::new(SessionTable::new()),
            session_locks: Mutex::new(HashMap::new()),
            watches: Mutex::new(WatchTable::new()),
            perf: PerfCounter::new(),
            peers: PeerClients::new(),
            commit_notify: Notify::new(),
            replication_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            append_serial: Mutex::new(()),
            election_started: AtomicBool::new(false),
            mc_generation: AtomicU64::new(0),
        });

        if enable_snapshot {
            node.load_snapshot()?;
        }
        Ok(node)
    }

    /// Spawn the apply loop, election timer, session sweeper, and the
    /// optional compaction/snapshot loops. Requires a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move { node.apply_loop().await });

        if !self.cfg.quiet {
            self.start_election_timer();
        }

        let node = self.clone();
        tokio::spawn(async move {
            loop {
                node.interruptible_sleep(SESSION_SWEEP_INTERVAL).await;
                if node.stopped() {
                    return;
                }
                node.remove_expired_sessions();
            }
        });

        if self.cfg.enable_log_compaction {
            let node = self.clone();
            tokio::spawn(async move { node.gc_loop().await });
        }

        if self.cfg.enable_snapshot {
            let node = self.clone();
            tokio::spawn(async move { node.snapshot_writer_loop().await });
        }
    }

    /// Flag every loop to exit and wake the sleepers
    pub fn shutdown(&self) {
        {
            let mut core = self.core.lock().unwrap();
            core.stop = true;
        }
        self.commit_notify.notify_waiters();
        self.replication_notify.notify_waiters();
        self.shutdown_notify.notify_waiters();
        tracing::info!("node {} shutting down", self.self_id);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.core.lock().unwrap().stop
    }

    /// Sleep that shutdown can cut short
    pub(crate) async fn interruptible_sleep(&self, duration: std::time::Duration) {
        let _ = tokio::time::timeout(duration, self.shutdown_notify.notified()).await;
    }

    pub fn role(&self) -> NodeRole {
        self.core.lock().unwrap().role
    }

    pub fn current_term(&self) -> i64 {
        self.core.lock().unwrap().current_term
    }

    pub fn current_leader(&self) -> String {
        self.core.lock().unwrap().current_leader.clone()
    }

    /// Local role, term, and log/commit/apply positions
    pub fn show_status(&self) -> ShowStatusResponse {
        let (last_log_index, last_log_term) = self.binlog.lock().unwrap().last_log_index_and_term();
        let core = self.core.lock().unwrap();
        let status = match core.role {
            NodeRole::Follower => proto::NodeRole::Follower,
            NodeRole::Candidate => proto::NodeRole::Candidate,
            NodeRole::Leader => proto::NodeRole::Leader,
        };
        ShowStatusResponse {
            status: status as i32,
            term: core.current_term,
            last_log_index,
            last_log_term,
            commit_index: core.commit_index,
            last_applied: core.last_applied,
        }
    }

    /// Drop sessions past their lease, cancel their watches, and (on the
    /// leader) propose Unlock entries for the locks they held plus Logout
    /// entries for their login uuids.
    pub(crate) fn remove_expired_sessions(&self) {
        let (cur_term, cur_role) = {
            let core = self.core.lock().unwrap();
            if core.stop {
                return;
            }
            (core.current_term, core.role)
        };

        let expired = self.sessions.lock().unwrap().remove_expired(get_micros());
        if expired.is_empty() {
            return;
        }

        {
            let mut watches = self.watches.lock().unwrap();
            for session in &expired {
                // dropping the events completes the parked watch RPCs
                let _ = watches.take_by_session(&session.session_id);
            }
        }

        let mut unlock_keys = Vec::new();
        {
            let mut session_locks = self.session_locks.lock().unwrap();
            for session in &expired {
                if let Some(keys) = session_locks.remove(&session.session_id) {
                    for key in keys {
                        unlock_keys.push((key, session.clone()));
                    }
                }
            }
        }

        if cur_role != NodeRole::Leader {
            return;
        }
        {
            let mut binlog = self.binlog.lock().unwrap();
            for (key, session) in &unlock_keys {
                tracing::info!(
                    "session {} expired, unlocking {}",
                    session.session_id,
                    key
                );
                let entry = LogEntry {
                    term: cur_term,
                    op: LogOp::Unlock,
                    key: key.clone(),
                    value: session.session_id.clone().into_bytes(),
                    user: self.users.username_from_uuid(&session.uuid),
                };
                if let Err(e) = binlog.append_entry(&entry) {
                    tracing::error!("append expired-session unlock: {}", e);
                    return;
                }
            }
            for session in &expired {
                if session.uuid.is_empty() {
                    continue;
                }
                let entry = LogEntry {
                    term: cur_term,
                    op: LogOp::Logout,
                    key: String::new(),
                    value: Vec::new(),
                    user: session.uuid.clone(),
                };
                if let Err(e) = binlog.append_entry(&entry) {
                    tracing::error!("append expired-session logout: {}", e);
                    return;
                }
            }
        }
        self.replication_notify.notify_waiters();
        {
            let mut core = self.core.lock().unwrap();
            if core.single_node_mode {
                let length = self.binlog.lock().unwrap().get_length();
                self.update_commit_index(&mut core, length - 1);
            }
        }
    }

    /// Refuse unsafe compaction, otherwise drop the log prefix
    pub(crate) fn clean_binlog(&self, end_index: i64) -> Result<()> {
        {
            let core = self.core.lock().unwrap();
            if core.last_applied < end_index {
                return Err(Error::Internal(format!(
                    "refusing unsafe binlog clean: {} > last_applied {}",
                    end_index, core.last_applied
                )));
            }
        }
        tracing::info!("removing binlog prefix below {}", end_index);
        self.binlog.lock().unwrap().remove_slot_before(end_index)?;
        Ok(())
    }
}
