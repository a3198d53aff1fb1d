//! Role state and the volatile consensus bookkeeping behind the core mutex

use crate::proto::{
    AddNodeResponse, DelResponse, LockResponse, LoginResponse, LogoutResponse, PutResponse,
    RegisterResponse, UnlockResponse,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::oneshot;

/// Raft role of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// Pending client completion, keyed by the log index that satisfies it.
///
/// The apply loop fills the matching variant once that index is applied;
/// dropping a sender (leadership loss) fails the waiting RPC.
pub enum ClientAck {
    Put(oneshot::Sender<PutResponse>),
    Del(oneshot::Sender<DelResponse>),
    Lock(oneshot::Sender<LockResponse>),
    Unlock(oneshot::Sender<UnlockResponse>),
    Login(oneshot::Sender<LoginResponse>),
    Logout(oneshot::Sender<LogoutResponse>),
    Register(oneshot::Sender<RegisterResponse>),
    AddNode(oneshot::Sender<AddNodeResponse>),
}

/// At most one membership change may be in flight on the leader
pub struct MembershipChange {
    pub node_addr: String,
    /// Index of the AddNode entry once written, -1 while catching up
    pub log_index: i64,
    /// Guards the timeout task against completing a later change
    pub generation: u64,
    /// Caller completion until the AddNode entry is written
    pub sender: Option<oneshot::Sender<AddNodeResponse>>,
}

/// Everything the core mutex protects
pub struct Core {
    pub role: NodeRole,
    pub current_term: i64,
    pub voted_for: HashMap<i64, String>,
    pub vote_grant: HashMap<i64, usize>,
    /// Last known leader address, empty when unknown
    pub current_leader: String,
    pub commit_index: i64,
    pub last_applied: i64,
    pub in_safe_mode: bool,
    /// Heartbeats seen since the last election-timer tick
    pub heartbeat_count: u64,
    /// Membership currently in force (kept in sync with `changed_members`)
    pub members: Vec<String>,
    /// Membership vectors by the log index they take effect at
    pub changed_members: BTreeMap<i64, Vec<String>>,
    pub next_index: HashMap<String, i64>,
    pub match_index: HashMap<String, i64>,
    /// Peers that currently have a live replicator task
    pub replicating: HashSet<String>,
    pub client_ack: HashMap<i64, ClientAck>,
    pub membership_change: Option<MembershipChange>,
    /// Completion time of the last read-confirming heartbeat round (µs)
    pub heartbeat_read_us: i64,
    pub last_safe_clean_index: i64,
    pub quiet: bool,
    pub single_node_mode: bool,
    pub stop: bool,
}

impl Core {
    pub fn new(members: Vec<String>, quiet: bool) -> Self {
        let single_node_mode = members.len() == 1;
        let mut changed_members = BTreeMap::new();
        changed_members.insert(-1, members.clone());
        Self {
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: HashMap::new(),
            vote_grant: HashMap::new(),
            current_leader: String::new(),
            commit_index: -1,
            last_applied: -1,
            in_safe_mode: true,
            heartbeat_count: 0,
            members,
            changed_members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            replicating: HashSet::new(),
            client_ack: HashMap::new(),
            membership_change: None,
            heartbeat_read_us: 0,
            last_safe_clean_index: -1,
            quiet,
            single_node_mode,
            stop: false,
        }
    }

    /// Membership in force at `log_index`: the vector recorded at the
    /// greatest key not exceeding it.
    pub fn membership_at(&self, log_index: i64) -> &[String] {
        self.changed_members
            .range(..=log_index)
            .next_back()
            .map(|(_, members)| members.as_slice())
            .expect("changed_members always holds a base entry")
    }

    /// Record `new_node_addr` joining at `log_index`. Safe to re-run when
    /// the entry is applied after the leader already recorded it at append
    /// time.
    pub fn update_membership(&mut self, log_index: i64, new_node_addr: &str) {
        if !self.changed_members.contains_key(&log_index) {
            let mut new_members = self.members.clone();
            if !new_members.iter().any(|m| m == new_node_addr) {
                new_members.push(new_node_addr.to_string());
            }
            self.changed_members.insert(log_index, new_members);
        }
        if !self.members.iter().any(|m| m == new_node_addr) {
            self.members.push(new_node_addr.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_membership_at_base() {
        let core = Core::new(members(&["a", "b", "c"]), false);
        assert_eq!(core.membership_at(-1), members(&["a", "b", "c"]).as_slice());
        assert_eq!(core.membership_at(100), members(&["a", "b", "c"]).as_slice());
    }

    #[test]
    fn test_membership_change_takes_effect_at_index() {
        let mut core = Core::new(members(&["a", "b", "c"]), false);
        core.update_membership(10, "d");
        assert_eq!(core.membership_at(9).len(), 3);
        assert_eq!(core.membership_at(10).len(), 4);
        assert_eq!(core.membership_at(11).len(), 4);
        assert_eq!(core.members.len(), 4);
    }

    #[test]
    fn test_update_membership_is_idempotent() {
        let mut core = Core::new(members(&["a", "b"]), false);
        // the leader records at append time, then again at apply time
        core.update_membership(5, "c");
        core.update_membership(5, "c");
        assert_eq!(core.members.len(), 3);
        assert_eq!(core.membership_at(5).len(), 3);
    }

    #[test]
    fn test_single_node_mode_detected() {
        let core = Core::new(members(&["solo"]), false);
        assert!(core.single_node_mode);
        let core = Core::new(members(&["a", "b"]), false);
        assert!(!core.single_node_mode);
    }
}
