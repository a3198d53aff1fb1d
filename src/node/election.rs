//! Election timer, vote handling, and role transitions

use crate::common::{random_range, Error};
use crate::node::server::Node;
use crate::node::state::{Core, NodeRole};
use crate::proto::{AppendEntriesRequest, VoteRequest, VoteResponse};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Leader heartbeat period
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

impl Node {
    /// Arm the randomized election timer; idempotent. Quiet replicas call
    /// this only once a committed AddNode names them.
    pub(crate) fn start_election_timer(self: &Arc<Self>) {
        if self.election_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let timeout = random_range(
                    node.cfg.elect_timeout_min_ms,
                    node.cfg.elect_timeout_max_ms,
                );
                node.interruptible_sleep(Duration::from_millis(timeout)).await;
                if node.stopped() {
                    return;
                }
                if !node.try_to_be_leader() {
                    return;
                }
            }
        });
    }

    /// One election-timer tick: step aside if the leader is alive, start a
    /// new candidacy otherwise. Returns whether the timer should re-arm.
    pub(crate) fn try_to_be_leader(self: &Arc<Self>) -> bool {
        let broadcast = {
            let mut core = self.core.lock().unwrap();
            if core.stop {
                return false;
            }
            if core.single_node_mode {
                core.role = NodeRole::Leader;
                core.current_leader = self.self_id.clone();
                core.in_safe_mode = false;
                core.commit_index = core.commit_index.max(core.last_applied);
                core.current_term += 1;
                self.persist_term(&core);
                return false;
            }
            if core.role == NodeRole::Leader {
                return true;
            }
            if core.role == NodeRole::Follower && core.heartbeat_count > 0 {
                core.heartbeat_count = 0;
                return true;
            }
            core.current_term += 1;
            self.persist_term(&core);
            core.role = NodeRole::Candidate;
            let new_term = core.current_term;
            core.voted_for.insert(new_term, self.self_id.clone());
            self.persist_vote(new_term, &self.self_id);
            let grants = {
                let grants = core.vote_grant.entry(new_term).or_insert(0);
                *grants += 1;
                *grants
            };
            // thresholds use the membership in force at our own apply
            // position, never an uncommitted AddNode's eager view
            if grants * 2 > core.membership_at(core.last_applied).len() {
                self.trans_to_leader(&mut core);
                return true;
            }

            let (last_log_index, last_log_term) =
                self.binlog.lock().unwrap().last_log_index_and_term();
            let request = VoteRequest {
                candidate_id: self.self_id.clone(),
                term: core.current_term,
                last_log_index,
                last_log_term,
            };
            tracing::info!(
                "broadcast vote request to cluster, new term: {}",
                core.current_term
            );
            let peers: Vec<String> = core
                .members
                .iter()
                .filter(|m| *m != &self.self_id)
                .cloned()
                .collect();
            (request, peers)
        };

        let (request, peers) = broadcast;
        for peer in peers {
            let node = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = node.peers.vote(&peer, request).await;
                node.on_vote_response(&peer, result);
            });
        }
        true
    }

    fn on_vote_response(self: &Arc<Self>, peer: &str, result: crate::Result<VoteResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("vote request to {} failed: {}", peer, e);
                return;
            }
        };
        let mut core = self.core.lock().unwrap();
        if core.role != NodeRole::Candidate {
            return;
        }
        tracing::info!(
            "vote response from {} [{}], granted: {}",
            peer,
            response.term,
            response.vote_granted
        );
        if response.vote_granted && response.term == core.current_term {
            let term = core.current_term;
            let grants = {
                let grants = core.vote_grant.entry(term).or_insert(0);
                *grants += 1;
                *grants
            };
            if grants * 2 > core.membership_at(core.last_applied).len() {
                self.trans_to_leader(&mut core);
            }
        } else if response.term > core.current_term {
            self.trans_to_follower("vote response", response.term, &mut core);
        }
    }

    /// Vote receiver contract: reject stale terms and stale logs, record at
    /// most one vote per term, durably before answering.
    pub fn handle_vote(&self, request: &VoteRequest) -> VoteResponse {
        let mut core = self.core.lock().unwrap();
        let reject = |term: i64| VoteResponse {
            term,
            vote_granted: false,
        };
        if request.term < core.current_term {
            return reject(core.current_term);
        }
        let (last_log_index, last_log_term) =
            self.binlog.lock().unwrap().last_log_index_and_term();
        if request.last_log_term < last_log_term {
            return reject(core.current_term);
        }
        if request.last_log_term == last_log_term && request.last_log_index < last_log_index {
            return reject(core.current_term);
        }
        if request.term > core.current_term {
            self.trans_to_follower("vote request", request.term, &mut core);
        }
        let current_term = core.current_term;
        if let Some(voted) = core.voted_for.get(&current_term) {
            if voted != &request.candidate_id {
                return reject(current_term);
            }
        }
        core.voted_for
            .insert(current_term, request.candidate_id.clone());
        self.persist_vote(current_term, &request.candidate_id);
        VoteResponse {
            term: current_term,
            vote_granted: true,
        }
    }

    /// Adopt a higher term and fall back to follower. Pending client acks
    /// belong to the lost leadership and are failed by dropping them.
    pub(crate) fn trans_to_follower(&self, reason: &str, new_term: i64, core: &mut Core) {
        tracing::info!(
            "{}: term is outdated ({} < {}), trans to follower",
            reason,
            core.current_term,
            new_term
        );
        let was_leader = core.role == NodeRole::Leader;
        core.role = NodeRole::Follower;
        core.current_term = new_term;
        self.persist_term(core);
        if was_leader {
            core.client_ack.clear();
        }
    }

    pub(crate) fn trans_to_leader(self: &Arc<Self>, core: &mut Core) {
        core.in_safe_mode = true;
        core.role = NodeRole::Leader;
        core.current_leader = self.self_id.clone();
        tracing::info!("won the election, term: {}", core.current_term);
        let node = self.clone();
        tokio::spawn(async move { node.heartbeat_loop().await });
        self.start_replicate_log(core);
    }

    /// Broadcast empty AppendEntries every 50 ms while leader
    pub(crate) async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            let (term, request, peers) = {
                let core = self.core.lock().unwrap();
                if core.stop || core.role != NodeRole::Leader {
                    return;
                }
                let request = AppendEntriesRequest {
                    term: core.current_term,
                    leader_id: self.self_id.clone(),
                    prev_log_index: -1,
                    prev_log_term: -1,
                    leader_commit_index: core.commit_index,
                    entries: Vec::new(),
                };
                let peers: Vec<String> = core
                    .members
                    .iter()
                    .filter(|m| *m != &self.self_id)
                    .cloned()
                    .collect();
                (core.current_term, request, peers)
            };
            for peer in peers {
                let node = self.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    if let Ok(response) = node
                        .peers
                        .append_entries(&peer, request, crate::node::client::CONTROL_RPC_TIMEOUT)
                        .await
                    {
                        if response.current_term > term {
                            let mut core = node.core.lock().unwrap();
                            if response.current_term > core.current_term {
                                node.trans_to_follower(
                                    "heartbeat response",
                                    response.current_term,
                                    &mut core,
                                );
                            }
                        }
                    }
                });
            }
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    }

    pub(crate) fn persist_term(&self, core: &Core) {
        if let Err(e) = self.meta.lock().unwrap().write_current_term(core.current_term) {
            self.fatal("persist current term", e);
        }
    }

    pub(crate) fn persist_vote(&self, term: i64, candidate: &str) {
        if let Err(e) = self.meta.lock().unwrap().write_voted_for(term, candidate) {
            self.fatal("persist vote", e);
        }
    }

    /// Invariant-breaking persistence failures cannot be recovered from;
    /// the state machine must not advance past them.
    pub(crate) fn fatal(&self, context: &str, err: Error) -> ! {
        tracing::error!("fatal: {}: {}", context, err);
        std::process::abort();
    }
}
