//! Snapshot write/install, snapshot transfer, and binlog compaction

use crate::common::{get_micros, Result};
use crate::node::server::Node;
use crate::node::state::NodeRole;
use crate::proto::{CleanBinlogRequest, InstallSnapshotRequest, InstallSnapshotResponse, SnapshotItem};
use crate::storage::snapshot::{SnapshotMeta, SnapshotWriter, SNAPSHOT_META_KEY};
use crate::storage::{SnapshotStore, ANONYMOUS_USER};
use std::time::Duration;

/// Grace period before the first periodic snapshot
const SNAPSHOT_STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Receiver-side snapshot slot plus the in-progress transfer marker.
///
/// This mutex doubles as the snapshot-exclusion lock: the apply loop holds
/// it across each dispatch, so a snapshot never observes (or replaces)
/// half-applied state.
pub struct SnapshotState {
    pub store: SnapshotStore,
    pub writer: Option<SnapshotWriter>,
    /// Timestamp of the transfer currently being received, -1 when idle
    pub doing_timestamp: i64,
}

impl SnapshotState {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            writer: None,
            doing_timestamp: -1,
        }
    }
}

impl Node {
    /// Periodically persist a prefix-compacted snapshot of local state
    pub(crate) async fn snapshot_writer_loop(&self) {
        self.interruptible_sleep(SNAPSHOT_STARTUP_DELAY).await;
        loop {
            if self.stopped() {
                return;
            }
            match self.write_snapshot() {
                Ok(true) => tracing::info!("write snapshot success"),
                Ok(false) => tracing::info!("skip write snapshot"),
                Err(e) => tracing::warn!("write snapshot fail: {}", e),
            }
            self.interruptible_sleep(Duration::from_secs(self.cfg.snapshot_interval_secs))
                .await;
        }
    }

    /// Emit every anonymous record plus the covering meta into the
    /// temporary slot and swap it live. Quiesces the apply loop via the
    /// snapshot-exclusion lock.
    pub fn write_snapshot(&self) -> Result<bool> {
        let snapshot = self.snapshot.lock().unwrap();
        if snapshot.doing_timestamp != -1 {
            tracing::info!("receiving snapshot now, skip write snapshot");
            return Ok(false);
        }
        let (last_applied, term, voted, membership) = {
            let core = self.core.lock().unwrap();
            (
                core.last_applied,
                core.current_term,
                core.voted_for
                    .get(&core.current_term)
                    .cloned()
                    .unwrap_or_default(),
                core.members.clone(),
            )
        };

        let mut writer = snapshot.store.begin()?;
        let mut write_err = None;
        self.data_store.scan(ANONYMOUS_USER, "", |key, value| {
            match writer.add_record(key.as_bytes(), value) {
                Ok(()) => true,
                Err(e) => {
                    write_err = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = write_err {
            return Err(e);
        }
        writer.add_meta(&SnapshotMeta {
            term,
            log_index: last_applied,
            voted,
            membership,
        })?;
        writer.commit()?;
        Ok(true)
    }

    /// Receiver side of snapshot transfer. Chunks sharing the sender's
    /// timestamp accumulate into the temp slot; the `is_last` chunk commits
    /// it and loads the result.
    pub fn handle_install_snapshot(
        &self,
        request: &InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let finished = {
            let mut snapshot = self.snapshot.lock().unwrap();
            if snapshot.doing_timestamp != -1 {
                if snapshot.doing_timestamp != request.timestamp {
                    tracing::warn!(
                        "installing snapshot {}, refuse snapshot {}",
                        snapshot.doing_timestamp,
                        request.timestamp
                    );
                    return InstallSnapshotResponse { success: false };
                }
            } else {
                snapshot.doing_timestamp = request.timestamp;
                if let Err(e) = snapshot.store.delete_snapshot() {
                    tracing::warn!("delete old snapshot fail: {}", e);
                    snapshot.doing_timestamp = -1;
                    return InstallSnapshotResponse { success: false };
                }
                match snapshot.store.begin() {
                    Ok(writer) => snapshot.writer = Some(writer),
                    Err(e) => {
                        tracing::warn!("create new snapshot fail: {}", e);
                        snapshot.doing_timestamp = -1;
                        return InstallSnapshotResponse { success: false };
                    }
                }
                tracing::info!("start receive snapshot, timestamp: {}", request.timestamp);
            }

            let Some(writer) = snapshot.writer.as_mut() else {
                return InstallSnapshotResponse { success: false };
            };
            for item in &request.items {
                if let Err(e) = writer.add_record(&item.key, &item.val) {
                    tracing::warn!("write snapshot record fail: {}", e);
                    return InstallSnapshotResponse { success: false };
                }
            }
            if request.is_last {
                let writer = snapshot.writer.take();
                snapshot.doing_timestamp = -1;
                match writer.map(SnapshotWriter::commit) {
                    Some(Ok(())) => {
                        tracing::info!(
                            "finish receive snapshot, timestamp: {}, start load",
                            request.timestamp
                        );
                        true
                    }
                    _ => return InstallSnapshotResponse { success: false },
                }
            } else {
                false
            }
        };

        if finished {
            if let Err(e) = self.load_snapshot() {
                tracing::warn!("load received snapshot fail: {}", e);
                return InstallSnapshotResponse { success: false };
            }
        }
        InstallSnapshotResponse { success: true }
    }

    /// Replace all local state with the live snapshot: KV store, users,
    /// membership, term/vote meta, apply/commit positions, and the log
    /// floor. A snapshot behind our own apply position is ignored.
    pub(crate) fn load_snapshot(&self) -> Result<bool> {
        let snapshot = self.snapshot.lock().unwrap();
        let Some(meta) = snapshot.store.get_meta()? else {
            tracing::warn!("no available snapshot to load");
            return Ok(false);
        };
        let mut core = self.core.lock().unwrap();
        if meta.log_index <= core.last_applied {
            tracing::info!(
                "snapshot covers {} <= last_applied {}, keep local state",
                meta.log_index,
                core.last_applied
            );
            return Ok(false);
        }
        tracing::info!(
            "load snapshot, term: {}, last_applied_index: {}",
            meta.term,
            meta.log_index
        );

        self.data_store.reset()?;
        self.users.reset()?;
        let mut apply_err = None;
        snapshot.store.replay(|key, value| {
            let key = String::from_utf8_lossy(key).to_string();
            match self.data_store.put(ANONYMOUS_USER, &key, value) {
                Ok(()) => true,
                Err(e) => {
                    apply_err = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = apply_err {
            return Err(e);
        }

        core.members = meta.membership.clone();
        core.changed_members.clear();
        core.changed_members.insert(-1, meta.membership.clone());
        let mut self_in_cluster = false;
        for member in &core.members {
            if member == &self.self_id {
                tracing::info!("cluster member[self]: {}", member);
                self_in_cluster = true;
            } else {
                tracing::info!("cluster member: {}", member);
            }
        }
        if !self_in_cluster {
            tracing::warn!(
                "this node is not in the snapshot's membership, self: {}",
                self.self_id
            );
        }

        {
            let meta_store = self.meta.lock().unwrap();
            meta_store.write_current_term(meta.term)?;
            meta_store.write_voted_for(meta.term, &meta.voted)?;
        }
        core.voted_for.insert(meta.term, meta.voted.clone());
        self.data_store.write_last_applied(meta.log_index)?;
        core.last_applied = meta.log_index;
        core.commit_index = meta.log_index;
        core.current_term = meta.term;
        self.binlog
            .lock()
            .unwrap()
            .set_length_and_last_term(meta.log_index + 1, meta.term)?;
        tracing::info!(
            "snapshot loaded: last_applied {}, commit {}, term {}",
            core.last_applied,
            core.commit_index,
            core.current_term
        );
        Ok(true)
    }

    /// Stream the live snapshot to a follower whose required log prefix was
    /// compacted. Returns whether the follower is a pending new member that
    /// is now within `min_log_gap` of the log head.
    pub(crate) async fn try_send_snapshot(&self, follower_id: &str) -> Result<bool> {
        // Packets are cut from the on-disk snapshot up front: the live file
        // is replaced only by atomic rename, so the read stream stays
        // consistent without holding the exclusion lock across sends.
        let (packets, meta) = {
            let snapshot = self.snapshot.lock().unwrap();
            let Some(meta) = snapshot.store.get_meta()? else {
                tracing::warn!("get snapshot meta fail, nothing to send");
                return Ok(false);
            };
            let max_packet = self.cfg.max_snapshot_request_size;
            let mut packets: Vec<Vec<SnapshotItem>> = Vec::new();
            let mut current: Vec<SnapshotItem> = Vec::new();
            let mut current_size = 0usize;
            snapshot.store.replay(|key, value| {
                if current_size >= max_packet && !current.is_empty() {
                    packets.push(std::mem::take(&mut current));
                    current_size = 0;
                }
                current_size += key.len() + value.len();
                current.push(SnapshotItem {
                    key: key.to_vec(),
                    val: value.to_vec(),
                });
                true
            })?;
            // meta record travels last, in the final packet
            current.push(SnapshotItem {
                key: SNAPSHOT_META_KEY.to_vec(),
                val: meta.encode()?,
            });
            packets.push(current);
            (packets, meta)
        };

        let timestamp = get_micros();
        tracing::info!(
            "try send snapshot to {}, timestamp: {}",
            follower_id,
            timestamp
        );
        let last = packets.len() - 1;
        for (i, items) in packets.into_iter().enumerate() {
            let request = InstallSnapshotRequest {
                timestamp,
                items,
                is_last: i == last,
            };
            let response = self.peers.install_snapshot(follower_id, request).await?;
            if !response.success {
                return Err(crate::Error::Internal(format!(
                    "snapshot packet refused by {}",
                    follower_id
                )));
            }
        }
        tracing::info!("send snapshot to {} success", follower_id);

        let mut core = self.core.lock().unwrap();
        core.next_index
            .insert(follower_id.to_string(), meta.log_index + 1);
        core.match_index
            .insert(follower_id.to_string(), meta.log_index);
        tracing::info!(
            "set {} next_index to {}, match_index to {}",
            follower_id,
            meta.log_index + 1,
            meta.log_index
        );
        let log_length = self.binlog.lock().unwrap().get_length();
        let in_membership = core.members.iter().any(|m| m == follower_id);
        let join_ready = !in_membership
            && core.membership_change.is_some()
            && meta.log_index + 1 + self.cfg.min_log_gap >= log_length;
        Ok(join_ready)
    }

    /// Leader-side compaction sweep: collect apply progress from every
    /// member, then broadcast the safe clean floor.
    pub(crate) async fn gc_loop(&self) {
        loop {
            self.interruptible_sleep(Duration::from_secs(self.cfg.gc_interval_secs))
                .await;
            if self.stopped() {
                return;
            }
            let (is_leader, members, own_applied) = {
                let core = self.core.lock().unwrap();
                (
                    core.role == NodeRole::Leader,
                    core.members.clone(),
                    core.last_applied,
                )
            };
            if !is_leader {
                continue;
            }

            let mut min_applied = own_applied;
            let mut got_all = true;
            for member in &members {
                if member == &self.self_id {
                    continue;
                }
                match self.peers.show_status(member).await {
                    Ok(status) => min_applied = min_applied.min(status.last_applied),
                    Err(e) => {
                        tracing::info!("failed to get last_applied from {}: {}", member, e);
                        got_all = false;
                        break;
                    }
                }
            }
            if !got_all {
                continue;
            }

            let safe_clean_index = min_applied - 1;
            let changed = {
                let mut core = self.core.lock().unwrap();
                let old = core.last_safe_clean_index;
                core.last_safe_clean_index = safe_clean_index;
                old != safe_clean_index
            };
            if !changed || safe_clean_index <= 0 {
                continue;
            }
            tracing::info!("[gc] safe clean index is: {}", safe_clean_index);
            for member in &members {
                if member == &self.self_id {
                    if let Err(e) = self.clean_binlog(safe_clean_index) {
                        tracing::info!("local binlog clean refused: {}", e);
                    }
                    continue;
                }
                let request = CleanBinlogRequest {
                    end_index: safe_clean_index,
                };
                if let Err(e) = self.peers.clean_binlog(member, request).await {
                    tracing::info!("failed to send clean binlog request to {}: {}", member, e);
                }
            }
        }
    }
}
