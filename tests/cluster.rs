//! Three-replica cluster over real gRPC: election, replicated writes,
//! leader-confirmed reads, failover, and single-server membership add

use quorumkv::node::{NodeRole, NodeService};
use quorumkv::{Config, Node};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("127.0.0.1:{}", addr.port())
}

fn cluster_config(id: &str, members: &[String], root: &Path) -> Config {
    let sub = id.replace(':', "_");
    let mut cfg = Config::new(id, members.to_vec());
    cfg.data_dir = root.join(&sub).join("data");
    cfg.binlog_dir = root.join(&sub).join("binlog");
    cfg.snapshot_dir = root.join(&sub).join("snapshot");
    cfg.session_expire_timeout_us = 500_000;
    cfg.enable_log_compaction = false;
    cfg
}

struct TestReplica {
    node: Arc<Node>,
    server: JoinHandle<()>,
}

impl TestReplica {
    async fn spawn(id: &str, members: &[String], root: &Path, quiet: bool) -> TestReplica {
        let mut cfg = cluster_config(id, members, root);
        cfg.quiet = quiet;
        let node = Node::new(cfg).unwrap();
        node.start();
        let service = NodeService::new(node.clone());
        let bind = id.parse().unwrap();
        let server = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve(bind)
                .await;
        });
        TestReplica { node, server }
    }

    fn kill(&self) {
        self.node.shutdown();
        self.server.abort();
    }
}

async fn wait_for_leader(replicas: &[&TestReplica]) -> usize {
    for _ in 0..400 {
        for (i, replica) in replicas.iter().enumerate() {
            if replica.node.role() == NodeRole::Leader {
                return i;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no leader elected");
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Propose a write against whichever replica currently leads, retrying
/// across elections until it commits.
async fn put_via_leader(replicas: &[&TestReplica], key: &str, value: &[u8]) -> usize {
    for _ in 0..200 {
        let leader_idx = wait_for_leader(replicas).await;
        let resp = replicas[leader_idx]
            .node
            .put(key.to_string(), value.to_vec(), String::new())
            .await;
        if resp.success {
            return leader_idx;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("write {} never committed", key);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_write_read_and_replication() {
    let root = TempDir::new().unwrap();
    let members: Vec<String> = (0..3).map(|_| free_addr()).collect();
    let mut replicas = Vec::new();
    for id in &members {
        replicas.push(TestReplica::spawn(id, &members, root.path(), false).await);
    }
    let all: Vec<&TestReplica> = replicas.iter().collect();
    let leader_idx = put_via_leader(&all, "x", b"1").await;
    let leader = &replicas[leader_idx].node;

    let mut got = None;
    for _ in 0..100 {
        let resp = leader.get("x".into(), String::new()).await;
        if resp.success {
            got = Some(resp);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let got = got.expect("leader-confirmed read never succeeded");
    assert!(got.hit);
    assert_eq!(got.value, b"1");

    // every follower converges on the same applied prefix
    let leader_applied = leader.show_status().last_applied;
    wait_until("followers to apply the leader's prefix", || {
        replicas
            .iter()
            .all(|r| r.node.show_status().last_applied >= leader_applied)
    })
    .await;

    // followers redirect writes to the leader
    let follower = &replicas[(leader_idx + 1) % 3].node;
    let resp = follower.put("y".into(), b"2".to_vec(), String::new()).await;
    assert!(!resp.success);
    assert_eq!(resp.leader_id, members[leader_idx]);

    for replica in &replicas {
        replica.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_preserves_committed_writes() {
    let root = TempDir::new().unwrap();
    let members: Vec<String> = (0..3).map(|_| free_addr()).collect();
    let mut replicas = Vec::new();
    for id in &members {
        replicas.push(TestReplica::spawn(id, &members, root.path(), false).await);
    }
    let all: Vec<&TestReplica> = replicas.iter().collect();
    let leader_idx = put_via_leader(&all, "k", b"v").await;

    // make sure the write reached the survivors before the crash
    let committed_at = replicas[leader_idx].node.show_status().last_applied;
    wait_until("replication to the survivors", || {
        replicas
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != leader_idx)
            .all(|(_, r)| r.node.show_status().last_applied >= committed_at)
    })
    .await;

    replicas[leader_idx].kill();

    let survivors: Vec<&TestReplica> = replicas
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader_idx)
        .map(|(_, r)| r)
        .collect();
    let new_leader_idx = wait_for_leader(&survivors).await;
    let new_leader = &survivors[new_leader_idx].node;

    let mut got = None;
    for _ in 0..200 {
        let resp = new_leader.get("k".into(), String::new()).await;
        if resp.success {
            got = Some(resp);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let got = got.expect("read after failover never succeeded");
    assert!(got.hit, "committed write lost across failover");
    assert_eq!(got.value, b"v");

    for replica in &replicas {
        replica.kill();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_node_grows_the_cluster() {
    let root = TempDir::new().unwrap();
    let members: Vec<String> = (0..3).map(|_| free_addr()).collect();
    let mut replicas = Vec::new();
    for id in &members {
        replicas.push(TestReplica::spawn(id, &members, root.path(), false).await);
    }
    let all: Vec<&TestReplica> = replicas.iter().collect();
    let leader_idx = put_via_leader(&all, "seed", b"1").await;
    let leader = &replicas[leader_idx].node;

    // the newcomer starts quiet: no vote, no election timer, outside the
    // counted membership until its AddNode entry commits
    let new_addr = free_addr();
    let mut quiet_members = members.clone();
    quiet_members.push(new_addr.clone());
    let newcomer = TestReplica::spawn(&new_addr, &quiet_members, root.path(), true).await;

    let mut added = false;
    for _ in 0..10 {
        let leader_idx = wait_for_leader(&all).await;
        let resp = replicas[leader_idx].node.add_node(new_addr.clone()).await;
        if resp.success {
            added = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(added, "add_node did not complete");

    // the newcomer catches up and applies the same prefix
    let leader_applied = leader.show_status().last_applied;
    wait_until("newcomer to catch up", || {
        newcomer.node.show_status().last_applied >= leader_applied
    })
    .await;

    // and subsequent writes replicate to it as a member
    let writer_idx = put_via_leader(&all, "after", b"2").await;
    let leader_applied = replicas[writer_idx].node.show_status().last_applied;
    wait_until("newcomer to apply post-join writes", || {
        newcomer.node.show_status().last_applied >= leader_applied
    })
    .await;

    newcomer.kill();
    for replica in &replicas {
        replica.kill();
    }
}
