//! Log replication: the follower-side AppendEntries contract, the
//! per-follower replicator loops, and commit-index advancement

use crate::common::Error;
use crate::node::client::REPLICATION_RPC_TIMEOUT;
use crate::node::server::Node;
use crate::node::state::{Core, NodeRole};
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, Entry};
use crate::storage::LogEntry;
use std::sync::Arc;
use std::time::Duration;

/// How long a replicator naps waiting for new log entries
const REPLICATOR_IDLE_WAIT: Duration = Duration::from_secs(2);

enum ReplicateStep {
    Exit,
    Wait,
    Batch {
        request: AppendEntriesRequest,
        start: i64,
        span: i64,
        max_term: i64,
    },
    SendSnapshot,
}

impl Node {
    /// Follower-side AppendEntries. Bodies are serialized so interleaved
    /// batches cannot corrupt the suffix checks; the core mutex is released
    /// across the durable append of the entry batch.
    pub fn handle_append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        let _serial = self.append_serial.lock().unwrap();
        let mut core = self.core.lock().unwrap();

        if request.term < core.current_term {
            let log_length = self.binlog.lock().unwrap().get_length();
            tracing::info!("[append_entries] term is outdated");
            return AppendEntriesResponse {
                current_term: core.current_term,
                success: false,
                log_length,
                is_busy: false,
            };
        }
        if request.term > core.current_term {
            core.current_term = request.term;
            self.persist_term(&core);
        }
        core.role = NodeRole::Follower;
        core.current_leader = request.leader_id.clone();
        core.heartbeat_count += 1;

        if !request.entries.is_empty() {
            let mut binlog = self.binlog.lock().unwrap();
            let length = binlog.get_length();
            if request.prev_log_index >= length {
                tracing::info!(
                    "[append_entries] prev log is beyond, prev index {}, local length {}",
                    request.prev_log_index,
                    length
                );
                return AppendEntriesResponse {
                    current_term: core.current_term,
                    success: false,
                    log_length: length,
                    is_busy: false,
                };
            }
            if request.prev_log_index >= 0 {
                let prev_term = binlog.term_at(request.prev_log_index);
                let matches = matches!(&prev_term, Ok(t) if *t == request.prev_log_term);
                if !matches {
                    if prev_term.is_ok() {
                        // conflicting suffix: rewind one behind the
                        // mismatching entry
                        if let Err(e) = binlog.truncate(request.prev_log_index - 1) {
                            self.fatal("truncate conflicting suffix", e);
                        }
                    }
                    tracing::info!(
                        "[append_entries] prev term mismatch at {}",
                        request.prev_log_index
                    );
                    return AppendEntriesResponse {
                        current_term: core.current_term,
                        success: false,
                        log_length: binlog.get_length(),
                        is_busy: false,
                    };
                }
            }
        }

        // backpressure applies to heartbeats too: a follower deep in
        // unapplied commits refuses everything until apply catches up
        if let Err(e) = self.apply_backlog_gate(&core) {
            tracing::info!(
                "[append_entries] {} ({} applied of {})",
                e,
                core.last_applied,
                core.commit_index
            );
            return AppendEntriesResponse {
                current_term: core.current_term,
                success: false,
                log_length: self.binlog.lock().unwrap().get_length(),
                is_busy: true,
            };
        }

        let log_length;
        if !request.entries.is_empty() {
            {
                let mut binlog = self.binlog.lock().unwrap();
                if binlog.get_length() > request.prev_log_index + 1 {
                    let old_length = binlog.get_length();
                    if let Err(e) = binlog.truncate(request.prev_log_index) {
                        self.fatal("truncate stale suffix", e);
                    }
                    tracing::info!(
                        "[append_entries] log length alignment: {} -> {}",
                        old_length,
                        request.prev_log_index + 1
                    );
                }
            }
            // durable append without the core mutex; the serializer above
            // keeps competing batches out
            drop(core);
            let entries: Vec<LogEntry> = request.entries.iter().map(LogEntry::from).collect();
            {
                let mut binlog = self.binlog.lock().unwrap();
                if let Err(e) = binlog.append_batch(&entries) {
                    self.fatal("append replicated batch", e);
                }
                log_length = binlog.get_length();
            }
            core = self.core.lock().unwrap();
        } else {
            log_length = self.binlog.lock().unwrap().get_length();
        }

        let old_commit_index = core.commit_index;
        core.commit_index = old_commit_index.max(
            (log_length - 1).min(request.leader_commit_index),
        );
        if core.commit_index > old_commit_index {
            tracing::debug!("follower: commit index now {}", core.commit_index);
            self.commit_notify.notify_waiters();
        }
        AppendEntriesResponse {
            current_term: core.current_term,
            success: true,
            log_length,
            is_busy: false,
        }
    }

    /// Backpressure: refuse replication while more than
    /// `max_commit_pending` committed entries await the apply loop.
    fn apply_backlog_gate(&self, core: &Core) -> crate::Result<()> {
        if core.commit_index - core.last_applied > self.cfg.max_commit_pending {
            return Err(Error::BusyCommitPending);
        }
        Ok(())
    }

    /// Advance the commit index to `candidate` if a strict majority of the
    /// membership in force at that index has matched it.
    pub(crate) fn update_commit_index(&self, core: &mut Core, candidate: i64) {
        if candidate <= core.commit_index {
            return;
        }
        let members = core.membership_at(candidate);
        let mut match_count = 1; // self
        for member in members {
            if member == &self.self_id {
                continue;
            }
            if core
                .match_index
                .get(member)
                .map(|m| *m >= candidate)
                .unwrap_or(false)
            {
                match_count += 1;
            }
        }
        if match_count * 2 > members.len() {
            core.commit_index = candidate;
            tracing::debug!("update to new commit index: {}", candidate);
            self.commit_notify.notify_waiters();
        }
    }

    /// Set up replication progress for every peer and spawn their
    /// replicators, then append the new term's Nop barrier entry.
    pub(crate) fn start_replicate_log(self: &Arc<Self>, core: &mut Core) {
        tracing::info!("start replicate log");
        let log_length = self.binlog.lock().unwrap().get_length();
        for member in core.members.clone() {
            if member == self.self_id {
                continue;
            }
            if core.replicating.contains(&member) {
                tracing::info!("another task is replicating on: {}", member);
                continue;
            }
            core.next_index.insert(member.clone(), log_length);
            core.match_index.insert(member.clone(), -1);
            let node = self.clone();
            tokio::spawn(async move { node.replicate_log(member).await });
        }
        let nop = LogEntry::nop(core.current_term);
        if let Err(e) = self.binlog.lock().unwrap().append_entry(&nop) {
            self.fatal("append term barrier", e);
        }
        self.replication_notify.notify_waiters();
    }

    /// One logical replication worker per follower; runs while this node
    /// stays leader.
    pub(crate) async fn replicate_log(self: Arc<Self>, follower_id: String) {
        {
            let mut core = self.core.lock().unwrap();
            if !core.replicating.insert(follower_id.clone()) {
                return;
            }
        }
        let mut latest_replicating_ok = true;
        let mut pending_join = false;

        loop {
            let mut notified = std::pin::pin!(self.replication_notify.notified());
            notified.as_mut().enable();
            let step = self.next_replicate_step(&follower_id, latest_replicating_ok);
            match step {
                ReplicateStep::Exit => break,
                ReplicateStep::Wait => {
                    let _ = tokio::time::timeout(REPLICATOR_IDLE_WAIT, notified).await;
                }
                ReplicateStep::SendSnapshot => {
                    match self.try_send_snapshot(&follower_id).await {
                        Ok(join_ready) => {
                            if join_ready {
                                pending_join = true;
                                break;
                            }
                            latest_replicating_ok = true;
                        }
                        Err(e) => {
                            tracing::warn!("send snapshot to {} failed: {}", follower_id, e);
                            tokio::time::sleep(self.replication_retry_timespan()).await;
                        }
                    }
                }
                ReplicateStep::Batch {
                    request,
                    start,
                    span,
                    max_term,
                } => {
                    let result = self
                        .peers
                        .append_entries(&follower_id, request, REPLICATION_RPC_TIMEOUT)
                        .await;
                    match self.on_replicate_response(&follower_id, start, span, max_term, result) {
                        ReplicateOutcome::Continue { ok } => latest_replicating_ok = ok,
                        ReplicateOutcome::Retry => {
                            tokio::time::sleep(self.replication_retry_timespan()).await;
                            latest_replicating_ok = true;
                        }
                        ReplicateOutcome::RetryDegraded => {
                            tokio::time::sleep(self.replication_retry_timespan()).await;
                            latest_replicating_ok = false;
                        }
                        ReplicateOutcome::StepDown => break,
                        ReplicateOutcome::JoinReady => {
                            pending_join = true;
                            break;
                        }
                    }
                }
            }
        }

        {
            let mut core = self.core.lock().unwrap();
            core.replicating.remove(&follower_id);
        }
        if pending_join {
            self.write_membership_change_log(&follower_id);
        }
    }

    fn next_replicate_step(&self, follower_id: &str, latest_ok: bool) -> ReplicateStep {
        let core = self.core.lock().unwrap();
        if core.stop || core.role != NodeRole::Leader {
            return ReplicateStep::Exit;
        }
        let binlog = self.binlog.lock().unwrap();
        let next_index = core.next_index.get(follower_id).copied().unwrap_or(0);
        if binlog.get_length() <= next_index {
            return ReplicateStep::Wait;
        }

        let prev_index = next_index - 1;
        let prev_term = if prev_index >= 0 {
            match binlog.term_at(prev_index) {
                Ok(term) => term,
                Err(Error::LogGap(_)) => {
                    tracing::warn!(
                        "slot {} compacted, can't replicate on {}, try send snapshot",
                        prev_index,
                        follower_id
                    );
                    return ReplicateStep::SendSnapshot;
                }
                Err(e) => {
                    tracing::error!("read prev slot {}: {}", prev_index, e);
                    return ReplicateStep::Wait;
                }
            }
        } else {
            -1
        };

        let mut span = (binlog.get_length() - next_index).min(self.cfg.log_rep_batch_max);
        if !latest_ok {
            span = span.min(1);
        }
        let mut entries = Vec::with_capacity(span as usize);
        let mut max_term = -1;
        for index in next_index..next_index + span {
            match binlog.read_slot(index) {
                Ok(entry) => {
                    max_term = max_term.max(entry.term);
                    entries.push(Entry::from(&entry));
                }
                Err(Error::LogGap(_)) => {
                    tracing::warn!("slot {} compacted mid-batch, try send snapshot", index);
                    return ReplicateStep::SendSnapshot;
                }
                Err(e) => {
                    tracing::error!("read slot {}: {}", index, e);
                    return ReplicateStep::Wait;
                }
            }
        }
        ReplicateStep::Batch {
            request: AppendEntriesRequest {
                term: core.current_term,
                leader_id: self.self_id.clone(),
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                leader_commit_index: core.commit_index,
                entries,
            },
            start: next_index,
            span,
            max_term,
        }
    }

    fn on_replicate_response(
        &self,
        follower_id: &str,
        start: i64,
        span: i64,
        max_term: i64,
        result: crate::Result<AppendEntriesResponse>,
    ) -> ReplicateOutcome {
        let mut core = self.core.lock().unwrap();
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("failed to send replicate rpc to {}: {}", follower_id, e);
                return ReplicateOutcome::RetryDegraded;
            }
        };
        if response.current_term > core.current_term {
            self.trans_to_follower("replicate response", response.current_term, &mut core);
        }
        if core.role != NodeRole::Leader {
            tracing::info!("stop replicating, no longer leader");
            return ReplicateOutcome::StepDown;
        }
        if response.success {
            let matched = start + span - 1;
            core.next_index.insert(follower_id.to_string(), matched + 1);
            core.match_index.insert(follower_id.to_string(), matched);
            let in_membership = core
                .membership_at(matched)
                .iter()
                .any(|m| m == follower_id);
            if max_term == core.current_term && in_membership {
                self.update_commit_index(&mut core, matched);
            }
            if !in_membership {
                let log_length = self.binlog.lock().unwrap().get_length();
                if matched + 1 + self.cfg.min_log_gap >= log_length {
                    tracing::info!("new node {} caught up", follower_id);
                    return ReplicateOutcome::JoinReady;
                }
            }
            ReplicateOutcome::Continue { ok: true }
        } else if response.is_busy {
            tracing::info!("delay replicate rpc to {} [busy]", follower_id);
            ReplicateOutcome::Retry
        } else {
            // (index, term) mismatch: back off to the follower's log
            let next_index = core.next_index.get(follower_id).copied().unwrap_or(0);
            let adjusted = (next_index - 1).min(response.log_length).max(0);
            core.next_index.insert(follower_id.to_string(), adjusted);
            tracing::info!("adjust next_index of {} to {}", follower_id, adjusted);
            ReplicateOutcome::Continue { ok: true }
        }
    }

    /// The joining node caught up: append the AddNode entry, move the
    /// caller's completion onto it, and flip membership at its index.
    pub(crate) fn write_membership_change_log(self: &Arc<Self>, new_node_addr: &str) {
        let mut core = self.core.lock().unwrap();
        if core.membership_change.is_none() {
            tracing::info!("not in membership change, maybe timed out");
            return;
        }
        let entry = LogEntry {
            term: core.current_term,
            op: crate::storage::LogOp::AddNode,
            key: new_node_addr.to_string(),
            value: Vec::new(),
            user: String::new(),
        };
        let index = {
            let mut binlog = self.binlog.lock().unwrap();
            match binlog.append_entry(&entry) {
                Ok(index) => index,
                Err(e) => self.fatal("append membership change entry", e),
            }
        };
        let sender = {
            let context = core.membership_change.as_mut().unwrap();
            context.log_index = index;
            context.sender.take()
        };
        if let Some(sender) = sender {
            core.client_ack
                .insert(index, crate::node::state::ClientAck::AddNode(sender));
        }
        core.update_membership(index, new_node_addr);
        let node = self.clone();
        let addr = new_node_addr.to_string();
        tokio::spawn(async move { node.replicate_log(addr).await });
        self.replication_notify.notify_waiters();
        if core.single_node_mode {
            let length = self.binlog.lock().unwrap().get_length();
            self.update_commit_index(&mut core, length - 1);
        }
    }

    pub(crate) fn replication_retry_timespan(&self) -> Duration {
        Duration::from_millis(self.cfg.replication_retry_timespan_ms)
    }
}

enum ReplicateOutcome {
    Continue { ok: bool },
    Retry,
    RetryDegraded,
    StepDown,
    JoinReady,
}
