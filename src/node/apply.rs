//! The apply loop: committed entries become state-machine mutations
//!
//! A single task applies entries strictly in log order. Each dispatch runs
//! under the snapshot-exclusion lock, so no snapshot is written or
//! installed across a half-applied entry. A failure to apply a committed
//! entry is unrecoverable: every replica must apply every committed entry.

use crate::common::{parent_key, Result};
use crate::node::server::Node;
use crate::node::state::{ClientAck, NodeRole};
use crate::proto::{
    AddNodeResponse, DelResponse, LockResponse, LoginResponse, LogoutResponse, PutResponse,
    RegisterResponse, RpcStatus, UnlockResponse, WatchResponse,
};
use crate::storage::store::{encode_value, parse_value, ValueTag};
use crate::storage::{LogEntry, LogOp};
use std::sync::Arc;
use std::time::Duration;

/// Second chance for a directory-level watch registered just after the
/// change fired
const PARENT_EVENT_RETRY: Duration = Duration::from_secs(2);

/// Watch-table keys carry the owning user: `user::key`
pub(crate) fn bind_key_and_user(user: &str, key: &str) -> String {
    format!("{}::{}", user, key)
}

/// Strip the user binding off an event key
pub(crate) fn key_from_event(event_key: &str) -> &str {
    match event_key.find("::") {
        Some(idx) => &event_key[idx + 2..],
        None => event_key,
    }
}

impl Node {
    pub(crate) async fn apply_loop(self: Arc<Self>) {
        loop {
            // register with the notifier before checking state, so a
            // commit landing in between cannot be missed
            let mut notified = std::pin::pin!(self.commit_notify.notified());
            notified.as_mut().enable();
            let (from, to, stop) = {
                let core = self.core.lock().unwrap();
                (core.last_applied, core.commit_index, core.stop)
            };
            if stop {
                return;
            }
            if to <= from {
                notified.await;
                continue;
            }
            for index in (from + 1)..=to {
                if let Err(e) = self.apply_one(index) {
                    self.fatal("apply committed entry", e);
                }
            }
        }
    }

    fn apply_one(self: &Arc<Self>, index: i64) -> Result<()> {
        let entry = self.binlog.lock().unwrap().read_slot(index)?;
        let mut nop_committed = false;
        let mut log_status = RpcStatus::Error;
        let mut new_uuid = String::new();

        {
            let _snapshot_guard = self.snapshot.lock().unwrap();
            match entry.op {
                LogOp::Put | LogOp::Lock => {
                    tracing::debug!(
                        "apply {:?} key: {}, user: {}",
                        entry.op,
                        entry.key,
                        entry.user
                    );
                    let tagged = encode_value(entry.op, &entry.value);
                    self.store_put(&entry.user, &entry.key, &tagged)?;
                    if entry.op == LogOp::Lock {
                        let session_id = String::from_utf8_lossy(&entry.value).to_string();
                        self.touch_parent_key(&entry.user, &entry.key, &session_id, "lock");
                        self.session_locks
                            .lock()
                            .unwrap()
                            .entry(session_id)
                            .or_default()
                            .insert(entry.key.clone());
                    }
                    self.trigger_event_with_parent(
                        bind_key_and_user(&entry.user, &entry.key),
                        entry.value.clone(),
                        false,
                    );
                }
                LogOp::Del => {
                    tracing::info!("delete from data store, key: {}", entry.key);
                    self.store_delete(&entry.user, &entry.key)?;
                    self.touch_parent_key(&entry.user, &entry.key, "", "del");
                    self.trigger_event_with_parent(
                        bind_key_and_user(&entry.user, &entry.key),
                        entry.value.clone(),
                        true,
                    );
                }
                LogOp::Unlock => {
                    let raw = self.store_get(&entry.user, &entry.key)?;
                    if let Some((ValueTag::Lock, held_session)) =
                        raw.as_deref().and_then(parse_value)
                    {
                        // DeleteIf: only the recorded holder's unlock counts
                        if held_session == entry.value {
                            self.store_delete(&entry.user, &entry.key)?;
                            tracing::info!("unlock on {}", entry.key);
                            let session_id = String::from_utf8_lossy(&held_session).to_string();
                            self.touch_parent_key(&entry.user, &entry.key, &session_id, "unlock");
                            self.trigger_event_with_parent(
                                bind_key_and_user(&entry.user, &entry.key),
                                entry.value.clone(),
                                true,
                            );
                        }
                    }
                }
                LogOp::Nop => {
                    let core = self.core.lock().unwrap();
                    tracing::info!(
                        "nop term: {}, current term: {}",
                        entry.term,
                        core.current_term
                    );
                    if entry.term == core.current_term {
                        nop_committed = true;
                    }
                }
                LogOp::Login => {
                    let passwd = String::from_utf8_lossy(&entry.value).to_string();
                    log_status = self.users.login(&entry.key, &passwd, &entry.user);
                    if log_status == RpcStatus::Ok {
                        new_uuid = entry.user.clone();
                        self.data_store.open_database(&entry.key)?;
                    }
                }
                LogOp::Logout => {
                    log_status = self.users.logout(&entry.user);
                }
                LogOp::Register => {
                    let passwd = String::from_utf8_lossy(&entry.value).to_string();
                    log_status = self.users.register(&entry.key, &passwd);
                }
                LogOp::AddNode => {
                    let new_node_addr = entry.key.clone();
                    tracing::info!(
                        "log index {} for add node {} has been committed",
                        index,
                        new_node_addr
                    );
                    let was_quiet_self = {
                        let mut core = self.core.lock().unwrap();
                        core.update_membership(index, &new_node_addr);
                        let was_quiet_self = core.quiet && new_node_addr == self.self_id;
                        if was_quiet_self {
                            core.quiet = false;
                        }
                        was_quiet_self
                    };
                    let node = self.clone();
                    let addr = new_node_addr.clone();
                    tokio::spawn(async move { node.replicate_log(addr).await });
                    if was_quiet_self {
                        // the cluster knows us now: enable leader election
                        self.start_election_timer();
                    }
                }
            }
        }

        let mut core = self.core.lock().unwrap();
        if core.role == NodeRole::Leader && nop_committed {
            core.in_safe_mode = false;
            tracing::info!("leave safe mode now");
        }
        if let Some(ack) = core.client_ack.remove(&index) {
            let completed_add_node = matches!(ack, ClientAck::AddNode(_));
            complete_client_ack(ack, log_status, new_uuid);
            if completed_add_node {
                core.membership_change = None;
            }
        }
        core.last_applied = index;
        self.data_store.write_last_applied(index)?;
        Ok(())
    }

    /// Put that lazily opens the user's sub-store on first touch
    pub(crate) fn store_put(&self, user: &str, key: &str, value: &[u8]) -> Result<()> {
        match self.data_store.put(user, key, value) {
            Err(crate::Error::UnknownUser(_)) => {
                self.data_store.open_database(user)?;
                self.data_store.put(user, key, value)
            }
            other => other,
        }
    }

    pub(crate) fn store_delete(&self, user: &str, key: &str) -> Result<()> {
        match self.data_store.delete(user, key) {
            Err(crate::Error::UnknownUser(_)) => {
                self.data_store.open_database(user)?;
                self.data_store.delete(user, key)
            }
            other => other,
        }
    }

    /// Read that treats a missing sub-store as a miss
    pub(crate) fn store_get(&self, user: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.data_store.get(user, key) {
            Err(crate::Error::UnknownUser(_)) => Ok(None),
            other => other,
        }
    }

    /// Write a `(action, session)` breadcrumb into the parent key to drive
    /// directory-level watches. The parent key is reserved for these
    /// events: whatever user data was stored there is overwritten.
    pub(crate) fn touch_parent_key(&self, user: &str, key: &str, session: &str, action: &str) {
        if let Some(parent) = parent_key(key) {
            let payload = format!("{},{}", action, session);
            let tagged = encode_value(LogOp::Put, payload.as_bytes());
            if let Err(e) = self.store_put(user, parent, &tagged) {
                tracing::warn!("touch parent key {} failed: {}", parent, e);
            }
        }
    }

    /// Fire watches on the changed key and on its parent. A parent watch
    /// that is not registered yet gets one delayed retry.
    pub(crate) fn trigger_event_with_parent(
        self: &Arc<Self>,
        event_key: String,
        value: Vec<u8>,
        deleted: bool,
    ) {
        self.trigger_event(&event_key, &event_key, &value, deleted);
        if let Some(parent) = parent_key(&event_key).map(str::to_string) {
            let triggered = self.trigger_event(&parent, &event_key, &value, deleted);
            if !triggered {
                let node = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(PARENT_EVENT_RETRY).await;
                    node.trigger_event(&parent, &event_key, &value, deleted);
                });
            }
        }
    }

    /// Fire-and-remove every watch on `watch_key`; returns whether any fired
    pub(crate) fn trigger_event(
        &self,
        watch_key: &str,
        event_key: &str,
        value: &[u8],
        deleted: bool,
    ) -> bool {
        let events = self.watches.lock().unwrap().take_by_key(watch_key);
        if events.is_empty() {
            tracing::debug!("watch list: no such key: {}", watch_key);
            return false;
        }
        let count = events.len();
        for event in events {
            let _ = event.sender.send(WatchResponse {
                success: true,
                watch_key: key_from_event(watch_key).to_string(),
                key: key_from_event(event_key).to_string(),
                value: value.to_vec(),
                deleted,
                canceled: false,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        tracing::info!("trigger #{} watch event: {}", count, event_key);
        true
    }

    /// Fire `session_id`'s watches on `watch_key` only
    pub(crate) fn trigger_event_by_session_and_key(
        &self,
        session_id: &str,
        watch_key: &str,
        value: &[u8],
        deleted: bool,
    ) {
        let events = self
            .watches
            .lock()
            .unwrap()
            .take_by_session_and_key(session_id, watch_key);
        for event in events {
            tracing::info!("trigger watch event: {} on {}", watch_key, session_id);
            let _ = event.sender.send(WatchResponse {
                success: true,
                watch_key: key_from_event(watch_key).to_string(),
                key: key_from_event(watch_key).to_string(),
                value: value.to_vec(),
                deleted,
                canceled: false,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
    }
}

fn complete_client_ack(ack: ClientAck, log_status: RpcStatus, new_uuid: String) {
    match ack {
        ClientAck::Put(sender) => {
            let _ = sender.send(PutResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        ClientAck::Del(sender) => {
            let _ = sender.send(DelResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        ClientAck::Lock(sender) => {
            let _ = sender.send(LockResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        ClientAck::Unlock(sender) => {
            let _ = sender.send(UnlockResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        ClientAck::Login(sender) => {
            let _ = sender.send(LoginResponse {
                status: log_status as i32,
                uuid: new_uuid,
                leader_id: String::new(),
            });
        }
        ClientAck::Logout(sender) => {
            let _ = sender.send(LogoutResponse {
                status: log_status as i32,
                leader_id: String::new(),
            });
        }
        ClientAck::Register(sender) => {
            let _ = sender.send(RegisterResponse {
                status: log_status as i32,
                leader_id: String::new(),
            });
        }
        ClientAck::AddNode(sender) => {
            let _ = sender.send(AddNodeResponse {
                success: true,
                leader_id: String::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_strip_event_keys() {
        assert_eq!(bind_key_and_user("alice", "a/b"), "alice::a/b");
        assert_eq!(bind_key_and_user("", "k"), "::k");
        assert_eq!(key_from_event("alice::a/b"), "a/b");
        assert_eq!(key_from_event("::k"), "k");
    }
}
