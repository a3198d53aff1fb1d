//! Client-facing operations
//!
//! Mutations are proposed into the log and complete when applied; reads
//! are leader-confirmed by a heartbeat round when the last one is stale.
//! Every response carries a `leader_id` hint for redirect on non-leaders.

use crate::common::{get_micros, random_unit, Error};
use crate::node::apply::bind_key_and_user;
use crate::node::perf::StatOp;
use crate::node::server::Node;
use crate::node::session::Session;
use crate::node::state::{ClientAck, MembershipChange, NodeRole};
use crate::proto::{
    AddNodeResponse, AppendEntriesRequest, CleanBinlogResponse, DelResponse, GetResponse,
    KeepAliveRequest, KeepAliveResponse, LockResponse, LoginResponse, LogoutResponse, PutResponse,
    RegisterResponse, RemoveNodeResponse, RpcStatRequest, RpcStatResponse, RpcStatus,
    ScanItem, ScanResponse, StatInfo, UnlockResponse, WatchRequest, WatchResponse,
};
use crate::storage::store::{encode_value, parse_value, ValueTag};
use crate::storage::{LogEntry, LogOp, TAG_LAST_APPLIED_INDEX};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// Scan responses stop growing near the RPC payload ceiling
const MAX_SCAN_BYTES: usize = 26 << 20;

/// Redirect hint carried by follower rejections
fn leader_hint(err: &Error) -> String {
    match err {
        Error::NotLeader(leader) => leader.clone(),
        _ => String::new(),
    }
}

impl Node {
    fn sample_access_log(&self, action: &str) {
        if random_unit() < self.cfg.trace_sample_ratio {
            tracing::info!("[trace] {}", action);
        }
    }

    /// Role and login checks shared by every client entry point
    fn client_gate(&self, core: &crate::node::state::Core, uuid: &str) -> crate::Result<()> {
        match core.role {
            NodeRole::Follower => return Err(Error::NotLeader(core.current_leader.clone())),
            NodeRole::Candidate => return Err(Error::LeaderUnknown),
            NodeRole::Leader => {}
        }
        if !uuid.is_empty() && !self.users.is_logged_in(uuid) {
            return Err(Error::UuidExpired);
        }
        Ok(())
    }

    fn is_expired_session(&self, session_id: &str) -> bool {
        !self.sessions.lock().unwrap().contains(session_id)
    }

    /// Startup quiescence: sessions from a prior leadership are only
    /// knowably expired after one full lease length.
    fn in_session_grace_period(&self) -> bool {
        get_micros() - self.server_start_us < self.cfg.session_expire_timeout_us
    }

    // === Proposals ===

    pub async fn put(&self, key: String, value: Vec<u8>, uuid: String) -> PutResponse {
        self.sample_access_log("Put");
        self.perf.count(StatOp::Put);
        let fail = |err: Error| PutResponse {
            success: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            if core.client_ack.len() > self.cfg.max_write_pending {
                tracing::warn!("write pending size: {}", core.client_ack.len());
                return fail(Error::WritePendingFull);
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Put,
                key,
                value,
                user: self.users.username_from_uuid(&uuid),
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Put(sender)) {
                Ok(()) => receiver,
                Err(err) => return fail(err),
            }
        };
        receiver.await.unwrap_or_else(|_| fail(Error::LeaderUnknown))
    }

    pub async fn del(&self, key: String, uuid: String) -> DelResponse {
        self.sample_access_log("Delete");
        self.perf.count(StatOp::Delete);
        let fail = |err: Error| DelResponse {
            success: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Del,
                key,
                value: Vec::new(),
                user: self.users.username_from_uuid(&uuid),
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Del(sender)) {
                Ok(()) => receiver,
                Err(err) => return fail(err),
            }
        };
        receiver.await.unwrap_or_else(|_| fail(Error::LeaderUnknown))
    }

    pub async fn lock(&self, key: String, session_id: String, uuid: String) -> LockResponse {
        self.sample_access_log("Lock");
        self.perf.count(StatOp::Lock);
        let fail = |err: Error| LockResponse {
            success: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            if core.in_safe_mode || self.in_session_grace_period() {
                tracing::info!("leader is still in safe mode for lock");
                return fail(Error::SafeMode);
            }
            let user = self.users.username_from_uuid(&uuid);
            if !self.lock_is_available(&user, &key, &session_id) {
                tracing::debug!("the lock {} is held by another session", key);
                return fail(Error::LockUnavailable);
            }
            tracing::info!("lock key: {}, session: {}", key, session_id);
            // record the holder locally right away; the committed entry
            // re-applies the same value
            let tagged = encode_value(LogOp::Lock, session_id.as_bytes());
            if let Err(err) = self.store_put(&user, &key, &tagged) {
                return fail(err);
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Lock,
                key,
                value: session_id.into_bytes(),
                user,
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Lock(sender)) {
                Ok(()) => receiver,
                Err(err) => return fail(err),
            }
        };
        receiver.await.unwrap_or_else(|_| fail(Error::LeaderUnknown))
    }

    pub async fn unlock(&self, key: String, session_id: String, uuid: String) -> UnlockResponse {
        self.sample_access_log("Unlock");
        self.perf.count(StatOp::Unlock);
        let fail = |err: Error| UnlockResponse {
            success: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Unlock,
                key,
                value: session_id.into_bytes(),
                user: self.users.username_from_uuid(&uuid),
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Unlock(sender)) {
                Ok(()) => receiver,
                Err(err) => return fail(err),
            }
        };
        receiver.await.unwrap_or_else(|_| fail(Error::LeaderUnknown))
    }

    pub async fn login(&self, username: String, passwd: String) -> LoginResponse {
        let fail = |status: RpcStatus, leader_id: String| LoginResponse {
            status: status as i32,
            uuid: String::new(),
            leader_id,
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, "") {
                return fail(RpcStatus::Error, leader_hint(&err));
            }
            if !self.users.is_valid_user(&username) {
                return fail(RpcStatus::UnknownUser, String::new());
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Login,
                key: username,
                value: passwd.into_bytes(),
                user: crate::node::users::UserManager::calc_uuid(),
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Login(sender)) {
                Ok(()) => receiver,
                Err(_) => return fail(RpcStatus::Error, String::new()),
            }
        };
        receiver
            .await
            .unwrap_or_else(|_| fail(RpcStatus::Error, String::new()))
    }

    pub async fn logout(&self, uuid: String) -> LogoutResponse {
        let fail = |status: RpcStatus, leader_id: String| LogoutResponse {
            status: status as i32,
            leader_id,
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, "") {
                return fail(RpcStatus::Error, leader_hint(&err));
            }
            if !uuid.is_empty() && !self.users.is_logged_in(&uuid) {
                return fail(RpcStatus::UnknownUser, String::new());
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Logout,
                key: String::new(),
                value: Vec::new(),
                user: uuid,
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Logout(sender)) {
                Ok(()) => receiver,
                Err(_) => return fail(RpcStatus::Error, String::new()),
            }
        };
        receiver
            .await
            .unwrap_or_else(|_| fail(RpcStatus::Error, String::new()))
    }

    pub async fn register(&self, username: String, passwd: String) -> RegisterResponse {
        let fail = |status: RpcStatus, leader_id: String| RegisterResponse {
            status: status as i32,
            leader_id,
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, "") {
                return fail(RpcStatus::Error, leader_hint(&err));
            }
            let entry = LogEntry {
                term: core.current_term,
                op: LogOp::Register,
                key: username,
                value: passwd.into_bytes(),
                user: String::new(),
            };
            let (sender, receiver) = oneshot::channel();
            match self.propose(&mut core, entry, ClientAck::Register(sender)) {
                Ok(()) => receiver,
                Err(_) => return fail(RpcStatus::Error, String::new()),
            }
        };
        receiver
            .await
            .unwrap_or_else(|_| fail(RpcStatus::Error, String::new()))
    }

    /// Append, register the completion under the new index, and wake the
    /// replicators (committing immediately in single-node mode).
    fn propose(
        &self,
        core: &mut crate::node::state::Core,
        entry: LogEntry,
        ack: ClientAck,
    ) -> crate::Result<()> {
        let index = {
            let mut binlog = self.binlog.lock().unwrap();
            binlog.append_entry(&entry)?
        };
        core.client_ack.insert(index, ack);
        self.replication_notify.notify_waiters();
        if core.single_node_mode {
            self.update_commit_index(core, index);
        }
        Ok(())
    }

    /// A lock is grantable when the key holds no live lock: absent key and
    /// live requester, an expired holder, or the requester itself
    /// (reentry).
    fn lock_is_available(&self, user: &str, key: &str, session_id: &str) -> bool {
        let raw = match self.store_get(user, key) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        match raw.as_deref().and_then(parse_value) {
            None => self.sessions.lock().unwrap().contains(session_id),
            Some((ValueTag::Lock, holder)) => {
                let holder = String::from_utf8_lossy(&holder).to_string();
                let sessions = self.sessions.lock().unwrap();
                let holder_live = sessions.contains(&holder);
                if !holder_live && sessions.contains(session_id) {
                    true
                } else {
                    holder_live && holder == session_id
                }
            }
            Some((ValueTag::Put, _)) => false,
        }
    }

    // === Reads ===

    /// Leader-confirmed Get. When the last confirming heartbeat round is
    /// older than `elect_timeout_min`, a fresh round must reach a majority
    /// in the current term before the local read is served.
    pub async fn get(self: &Arc<Self>, key: String, uuid: String) -> GetResponse {
        self.sample_access_log("Get");
        self.perf.count(StatOp::Get);
        let fail = |err: Error| GetResponse {
            success: false,
            hit: false,
            value: Vec::new(),
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };

        enum ReadPath {
            Local(String),
            Confirm {
                user: String,
                request: AppendEntriesRequest,
                peers: Vec<String>,
                term: i64,
                cluster_size: usize,
            },
        }

        let path = {
            let core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            if core.in_safe_mode {
                tracing::info!("leader is still in safe mode");
                return fail(Error::SafeMode);
            }
            let user = self.users.username_from_uuid(&uuid);
            let stale_us = 1000 * self.cfg.elect_timeout_min_ms as i64;
            if core.members.len() > 1 && get_micros() - core.heartbeat_read_us > stale_us {
                tracing::debug!("broadcast for read");
                ReadPath::Confirm {
                    user,
                    request: AppendEntriesRequest {
                        term: core.current_term,
                        leader_id: self.self_id.clone(),
                        prev_log_index: -1,
                        prev_log_term: -1,
                        leader_commit_index: core.commit_index,
                        entries: Vec::new(),
                    },
                    peers: core
                        .members
                        .iter()
                        .filter(|m| *m != &self.self_id)
                        .cloned()
                        .collect(),
                    term: core.current_term,
                    cluster_size: core.members.len(),
                }
            } else {
                ReadPath::Local(user)
            }
        };

        match path {
            ReadPath::Local(user) => self.read_local(&user, &key),
            ReadPath::Confirm {
                user,
                request,
                peers,
                term,
                cluster_size,
            } => {
                let mut round = JoinSet::new();
                for peer in peers {
                    let node = self.clone();
                    let request = request.clone();
                    round.spawn(async move {
                        node.peers
                            .append_entries(
                                &peer,
                                request,
                                crate::node::client::CONTROL_RPC_TIMEOUT,
                            )
                            .await
                    });
                }
                let mut succ_count = 1usize; // the local read counts
                let mut err_count = 0usize;
                while let Some(joined) = round.join_next().await {
                    match joined {
                        Ok(Ok(response)) => {
                            if response.current_term > term {
                                let mut core = self.core.lock().unwrap();
                                if response.current_term > core.current_term {
                                    self.trans_to_follower(
                                        "read heartbeat",
                                        response.current_term,
                                        &mut core,
                                    );
                                }
                                return fail(Error::LeaderUnknown);
                            }
                            succ_count += 1;
                            if succ_count * 2 > cluster_size {
                                self.core.lock().unwrap().heartbeat_read_us = get_micros();
                                return self.read_local(&user, &key);
                            }
                        }
                        _ => {
                            err_count += 1;
                            if err_count * 2 > cluster_size {
                                return fail(Error::LeaderUnknown);
                            }
                        }
                    }
                }
                fail(Error::LeaderUnknown)
            }
        }
    }

    /// Serve a Get from local state; lock values of expired sessions are
    /// reported as misses.
    fn read_local(&self, user: &str, key: &str) -> GetResponse {
        let miss = GetResponse {
            success: true,
            hit: false,
            value: Vec::new(),
            leader_id: String::new(),
            uuid_expired: false,
        };
        let raw = match self.store_get(user, key) {
            Ok(Some(raw)) => raw,
            _ => return miss,
        };
        let Some((tag, payload)) = parse_value(&raw) else {
            return miss;
        };
        if tag == ValueTag::Lock {
            let session = String::from_utf8_lossy(&payload).to_string();
            if self.is_expired_session(&session) {
                return miss;
            }
        }
        GetResponse {
            success: true,
            hit: true,
            value: payload,
            leader_id: String::new(),
            uuid_expired: false,
        }
    }

    pub fn scan(
        &self,
        start_key: String,
        end_key: String,
        size_limit: i32,
        uuid: String,
    ) -> ScanResponse {
        self.sample_access_log("Scan");
        self.perf.count(StatOp::Scan);
        let fail = |err: Error| ScanResponse {
            items: Vec::new(),
            has_more: false,
            success: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        {
            let core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &uuid) {
                return fail(err);
            }
            if core.in_safe_mode || self.in_session_grace_period() {
                tracing::info!("leader is still in safe mode for scan");
                return fail(Error::SafeMode);
            }
        }

        let user = self.users.username_from_uuid(&uuid);
        let mut items = Vec::new();
        let mut has_more = false;
        let mut payload_size = 0usize;
        let scan_result = self.data_store.scan(&user, &start_key, |key, value| {
            if !end_key.is_empty() && key >= end_key.as_str() {
                return false;
            }
            if items.len() >= size_limit.max(0) as usize || payload_size > MAX_SCAN_BYTES {
                has_more = true;
                return false;
            }
            if key == TAG_LAST_APPLIED_INDEX {
                return true;
            }
            let Some((tag, payload)) = parse_value(value) else {
                return true;
            };
            if tag == ValueTag::Lock {
                let session = String::from_utf8_lossy(&payload).to_string();
                if self.is_expired_session(&session) {
                    tracing::info!("skip expired lock value: {}", session);
                    return true;
                }
            }
            payload_size += key.len() + payload.len();
            items.push(ScanItem {
                key: key.to_string(),
                value: payload,
            });
            true
        });
        if scan_result.is_err() {
            // the uuid's sub-store is gone: the login no longer exists
            return ScanResponse {
                items: Vec::new(),
                has_more: false,
                success: true,
                leader_id: String::new(),
                uuid_expired: true,
            };
        }
        ScanResponse {
            items,
            has_more,
            success: true,
            leader_id: String::new(),
            uuid_expired: false,
        }
    }

    // === Sessions & watches ===

    /// Refresh a session lease and its held-lock set. Leaders forward the
    /// refresh to every follower so session state survives failover.
    pub fn keep_alive(self: &Arc<Self>, request: &KeepAliveRequest) -> KeepAliveResponse {
        self.sample_access_log("KeepAlive");
        self.perf.count(StatOp::KeepAlive);
        let is_leader = {
            let core = self.core.lock().unwrap();
            if !request.forward_from_leader {
                if let Err(err) = self.client_gate(&core, "") {
                    return KeepAliveResponse {
                        success: false,
                        leader_id: leader_hint(&err),
                    };
                }
            }
            core.role == NodeRole::Leader
        };

        let timeout_us = if request.timeout_milliseconds > 0 {
            request.timeout_milliseconds * 1000
        } else {
            self.cfg.session_expire_timeout_us
        };
        let session = Session {
            session_id: request.session_id.clone(),
            uuid: request.uuid.clone(),
            expiry_us: get_micros() + timeout_us,
        };
        tracing::debug!("recv session id: {}", session.session_id);
        self.sessions.lock().unwrap().upsert(session);
        {
            let mut session_locks = self.session_locks.lock().unwrap();
            let held = session_locks.entry(request.session_id.clone()).or_default();
            held.clear();
            held.extend(request.locks.iter().cloned());
        }

        if is_leader {
            self.forward_keep_alive(request);
        }
        KeepAliveResponse {
            success: true,
            leader_id: String::new(),
        }
    }

    fn forward_keep_alive(self: &Arc<Self>, request: &KeepAliveRequest) {
        let followers: Vec<String> = {
            let core = self.core.lock().unwrap();
            if core.role != NodeRole::Leader {
                return;
            }
            core.members
                .iter()
                .filter(|m| *m != &self.self_id)
                .cloned()
                .collect()
        };
        let mut forwarded = request.clone();
        forwarded.forward_from_leader = true;
        for follower in followers {
            let node = self.clone();
            let forwarded = forwarded.clone();
            tokio::spawn(async move {
                if let Err(e) = node.peers.keep_alive(&follower, forwarded).await {
                    tracing::debug!("forward keep alive to {} failed: {}", follower, e);
                }
            });
        }
    }

    /// Register a one-shot watch and park until it fires. Fires right away
    /// when the observed state already differs from what the client saw.
    pub async fn watch(self: &Arc<Self>, request: &WatchRequest) -> WatchResponse {
        self.sample_access_log("Watch");
        self.perf.count(StatOp::Watch);
        let fail = |err: Error| WatchResponse {
            success: false,
            watch_key: String::new(),
            key: String::new(),
            value: Vec::new(),
            deleted: false,
            canceled: false,
            leader_id: leader_hint(&err),
            uuid_expired: matches!(err, Error::UuidExpired),
        };
        {
            let core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, &request.uuid) {
                return fail(err);
            }
        }

        let user = self.users.username_from_uuid(&request.uuid);
        let bound_key = bind_key_and_user(&user, &request.key);
        let (sender, receiver) = oneshot::channel();
        let replaced = self.watches.lock().unwrap().insert(
            bound_key.clone(),
            request.session_id.clone(),
            sender,
        );
        for event in replaced {
            let _ = event.sender.send(WatchResponse {
                success: true,
                watch_key: String::new(),
                key: String::new(),
                value: Vec::new(),
                deleted: false,
                canceled: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }

        if !self.in_session_grace_period() {
            let raw = self.store_get(&user, &request.key).unwrap_or(None);
            let key_exist = raw.is_some();
            let (tag, current_value) = raw
                .as_deref()
                .and_then(parse_value)
                .unwrap_or((ValueTag::Put, Vec::new()));
            if current_value != request.old_value || key_exist != request.key_exist {
                tracing::info!("key {} already differs from the watcher's view", request.key);
                self.trigger_event_by_session_and_key(
                    &request.session_id,
                    &bound_key,
                    &current_value,
                    !key_exist,
                );
            } else if tag == ValueTag::Lock {
                let holder = String::from_utf8_lossy(&current_value).to_string();
                if self.is_expired_session(&holder) {
                    self.trigger_event_by_session_and_key(
                        &request.session_id,
                        &bound_key,
                        b"",
                        true,
                    );
                }
            }
        }

        receiver.await.unwrap_or_else(|_| fail(Error::LeaderUnknown))
    }

    // === Cluster management ===

    /// Admit one new server. The caller completes when the AddNode entry is
    /// applied, or fails on the catch-up deadline.
    pub async fn add_node(self: &Arc<Self>, node_addr: String) -> AddNodeResponse {
        let fail = |leader_id: String| AddNodeResponse {
            success: false,
            leader_id,
        };
        let receiver = {
            let mut core = self.core.lock().unwrap();
            if let Err(err) = self.client_gate(&core, "") {
                return fail(leader_hint(&err));
            }
            if core.membership_change.is_some() {
                tracing::info!("membership change in flight, refusing {}", node_addr);
                return fail(String::new());
            }
            let generation = self.mc_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (sender, receiver) = oneshot::channel();
            core.membership_change = Some(MembershipChange {
                node_addr: node_addr.clone(),
                log_index: -1,
                generation,
                sender: Some(sender),
            });
            core.next_index.insert(node_addr.clone(), 0);
            core.match_index.insert(node_addr.clone(), -1);
            tracing::info!("try to add node {}", node_addr);

            let node = self.clone();
            let addr = node_addr.clone();
            tokio::spawn(async move { node.replicate_log(addr).await });
            let node = self.clone();
            let deadline = Duration::from_secs(self.cfg.add_new_node_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                node.check_membership_change_failure(generation);
            });
            receiver
        };
        receiver.await.unwrap_or_else(|_| fail(String::new()))
    }

    /// Catch-up deadline passed before the AddNode entry applied: fail the
    /// caller and clear the context. Replication progress is kept.
    fn check_membership_change_failure(&self, generation: u64) {
        let mut core = self.core.lock().unwrap();
        let matches = core
            .membership_change
            .as_ref()
            .map(|c| c.generation == generation)
            .unwrap_or(false);
        if !matches {
            return;
        }
        tracing::info!("membership change timed out");
        let mut context = core.membership_change.take().unwrap();
        let sender = context.sender.take().or_else(|| {
            match core.client_ack.remove(&context.log_index) {
                Some(ClientAck::AddNode(sender)) => Some(sender),
                Some(other) => {
                    core.client_ack.insert(context.log_index, other);
                    None
                }
                None => None,
            }
        });
        if let Some(sender) = sender {
            let _ = sender.send(AddNodeResponse {
                success: false,
                leader_id: String::new(),
            });
        }
    }

    /// Declared on the wire but not implemented yet; membership reduction
    /// needs the same single-in-flight discipline as AddNode.
    pub fn remove_node(&self, _node_addr: String) -> RemoveNodeResponse {
        RemoveNodeResponse {
            success: false,
            leader_id: String::new(),
        }
    }

    pub fn handle_clean_binlog(&self, end_index: i64) -> CleanBinlogResponse {
        let success = match self.clean_binlog(end_index) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("clean binlog refused: {}", e);
                false
            }
        };
        CleanBinlogResponse { success }
    }

    pub fn rpc_stat(&self, request: &RpcStatRequest) -> RpcStatResponse {
        let ops: Vec<i32> = if request.op.is_empty() {
            (1..=8).collect()
        } else {
            request.op.clone()
        };
        let stats = ops
            .into_iter()
            .map(|op| match StatOp::from_wire(op) {
                Some(op) => StatInfo {
                    current_stat: self.perf.current(op),
                    average_stat: self.perf.average(op),
                },
                None => StatInfo {
                    current_stat: 0,
                    average_stat: 0,
                },
            })
            .collect();
        let status = match self.role() {
            NodeRole::Follower => crate::proto::NodeRole::Follower,
            NodeRole::Candidate => crate::proto::NodeRole::Candidate,
            NodeRole::Leader => crate::proto::NodeRole::Leader,
        };
        RpcStatResponse {
            stats,
            status: status as i32,
        }
    }
}
