//! Single-replica end-to-end flows: self-election, the proposal/commit/
//! apply pipeline, sessions, locks, watches, users, and compaction

use quorumkv::node::NodeRole;
use quorumkv::proto::{KeepAliveRequest, RpcStatus, WatchRequest};
use quorumkv::{Config, Node};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SELF_ID: &str = "127.0.0.1:7811";

fn single_config(dir: &TempDir) -> Config {
    let mut cfg = Config::new(SELF_ID, vec![SELF_ID.to_string()]);
    cfg.data_dir = dir.path().join("data");
    cfg.binlog_dir = dir.path().join("binlog");
    cfg.snapshot_dir = dir.path().join("snapshot");
    cfg.elect_timeout_min_ms = 50;
    cfg.elect_timeout_max_ms = 100;
    // short leases keep the grace-period and auto-release tests quick
    cfg.session_expire_timeout_us = 500_000;
    cfg.enable_log_compaction = false;
    cfg
}

async fn leader_node(dir: &TempDir) -> Arc<Node> {
    let node = Node::new(single_config(dir)).unwrap();
    node.start();
    for _ in 0..100 {
        if node.role() == NodeRole::Leader {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("single node did not elect itself");
}

fn keep_alive(session_id: &str, timeout_ms: i64, locks: Vec<String>) -> KeepAliveRequest {
    KeepAliveRequest {
        session_id: session_id.to_string(),
        uuid: String::new(),
        timeout_milliseconds: timeout_ms,
        locks,
        forward_from_leader: false,
    }
}

#[tokio::test]
async fn put_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;

    let resp = node.put("x".into(), b"1".to_vec(), String::new()).await;
    assert!(resp.success);

    let resp = node.get("x".into(), String::new()).await;
    assert!(resp.success);
    assert!(resp.hit);
    assert_eq!(resp.value, b"1");

    let resp = node.get("missing".into(), String::new()).await;
    assert!(resp.success);
    assert!(!resp.hit);

    let resp = node.del("x".into(), String::new()).await;
    assert!(resp.success);
    let resp = node.get("x".into(), String::new()).await;
    assert!(!resp.hit);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let node = leader_node(&dir).await;
        let resp = node.put("durable".into(), b"yes".to_vec(), String::new()).await;
        assert!(resp.success);
        node.shutdown();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let node = leader_node(&dir).await;
    let resp = node.get("durable".into(), String::new()).await;
    assert!(resp.hit);
    assert_eq!(resp.value, b"yes");
}

#[tokio::test]
async fn scan_skips_reserved_key_and_respects_limit() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    for key in ["scan/a", "scan/b", "scan/c", "scan/d"] {
        let resp = node.put(key.into(), b"v".to_vec(), String::new()).await;
        assert!(resp.success);
    }
    // wait out the safe-mode grace period for scans
    tokio::time::sleep(Duration::from_millis(600)).await;

    let resp = node.scan("scan/".into(), String::new(), 100, String::new());
    assert!(resp.success);
    assert_eq!(resp.items.len(), 4);
    assert!(!resp.has_more);
    assert!(resp
        .items
        .iter()
        .all(|item| item.key != "#TAG_LAST_APPLIED_INDEX#"));

    let resp = node.scan("scan/".into(), String::new(), 2, String::new());
    assert_eq!(resp.items.len(), 2);
    assert!(resp.has_more);

    let resp = node.scan("scan/b".into(), "scan/d".into(), 100, String::new());
    let keys: Vec<&str> = resp.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["scan/b", "scan/c"]);
}

#[tokio::test]
async fn lock_requires_live_session_and_allows_reentry() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // no session registered: not grantable
    let resp = node.lock("m".into(), "ghost".into(), String::new()).await;
    assert!(!resp.success);

    node.keep_alive(&keep_alive("s1", 10_000, vec![]));
    let resp = node.lock("m".into(), "s1".into(), String::new()).await;
    assert!(resp.success);

    // reentry by the holder succeeds, another live session is refused
    let resp = node.lock("m".into(), "s1".into(), String::new()).await;
    assert!(resp.success);
    node.keep_alive(&keep_alive("s2", 10_000, vec![]));
    let resp = node.lock("m".into(), "s2".into(), String::new()).await;
    assert!(!resp.success);

    // the wrong session cannot unlock (DeleteIf), the holder can
    let resp = node.unlock("m".into(), "s2".into(), String::new()).await;
    assert!(resp.success);
    let resp = node.get("m".into(), String::new()).await;
    assert!(resp.hit);
    let resp = node.unlock("m".into(), "s1".into(), String::new()).await;
    assert!(resp.success);
    let resp = node.get("m".into(), String::new()).await;
    assert!(!resp.hit);
}

#[tokio::test]
async fn expired_session_releases_its_locks() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    node.keep_alive(&keep_alive("s1", 400, vec![]));
    let resp = node.lock("release/me".into(), "s1".into(), String::new()).await;
    assert!(resp.success);

    // s1 stops refreshing; the sweeper proposes the unlock
    let mut unlocked = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let resp = node.get("release/me".into(), String::new()).await;
        if resp.success && !resp.hit {
            unlocked = true;
            break;
        }
    }
    assert!(unlocked, "expired session's lock was never released");

    node.keep_alive(&keep_alive("s2", 10_000, vec![]));
    let resp = node.lock("release/me".into(), "s2".into(), String::new()).await;
    assert!(resp.success);
}

#[tokio::test]
async fn watch_fires_once_on_change() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let resp = node.put("p".into(), b"v".to_vec(), String::new()).await;
    assert!(resp.success);
    node.keep_alive(&keep_alive("s1", 10_000, vec![]));

    let watcher = {
        let node = node.clone();
        tokio::spawn(async move {
            node.watch(&WatchRequest {
                key: "p".to_string(),
                old_value: b"v".to_vec(),
                key_exist: true,
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await
        })
    };
    // let the watch get registered before the write
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resp = node.put("p".into(), b"w".to_vec(), String::new()).await;
    assert!(resp.success);

    let fired = tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("watch did not fire")
        .unwrap();
    assert!(fired.success);
    assert!(!fired.deleted);
    assert_eq!(fired.key, "p");
    assert_eq!(fired.value, b"w");
}

#[tokio::test]
async fn watch_fires_immediately_on_stale_view() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let resp = node.put("q".into(), b"new".to_vec(), String::new()).await;
    assert!(resp.success);
    node.keep_alive(&keep_alive("s1", 10_000, vec![]));

    // the watcher's old_value is already outdated
    let fired = tokio::time::timeout(
        Duration::from_secs(5),
        node.watch(&WatchRequest {
            key: "q".to_string(),
            old_value: b"old".to_vec(),
            key_exist: true,
            session_id: "s1".to_string(),
            uuid: String::new(),
        }),
    )
    .await
    .expect("stale watch did not fire immediately");
    assert!(fired.success);
    assert_eq!(fired.value, b"new");
}

#[tokio::test]
async fn register_login_logout_flow() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;

    let resp = node.register("alice".into(), "secret".into()).await;
    assert_eq!(resp.status, RpcStatus::Ok as i32);
    let resp = node.register("alice".into(), "other".into()).await;
    assert_eq!(resp.status, RpcStatus::UserExists as i32);

    let resp = node.login("nobody".into(), "pw".into()).await;
    assert_eq!(resp.status, RpcStatus::UnknownUser as i32);
    let resp = node.login("alice".into(), "wrong".into()).await;
    assert_eq!(resp.status, RpcStatus::PasswordError as i32);

    let resp = node.login("alice".into(), "secret".into()).await;
    assert_eq!(resp.status, RpcStatus::Ok as i32);
    let uuid = resp.uuid.clone();
    assert!(!uuid.is_empty());

    // alice's data lives in her own sub-store
    let resp = node.put("private".into(), b"1".to_vec(), uuid.clone()).await;
    assert!(resp.success);
    let resp = node.get("private".into(), uuid.clone()).await;
    assert!(resp.hit);
    let resp = node.get("private".into(), String::new()).await;
    assert!(!resp.hit);

    let resp = node.logout(uuid.clone()).await;
    assert_eq!(resp.status, RpcStatus::Ok as i32);
    // the uuid is dead now
    let resp = node.put("private".into(), b"2".to_vec(), uuid).await;
    assert!(!resp.success);
    assert!(resp.uuid_expired);
}

#[tokio::test]
async fn clean_binlog_refuses_unsafe_floor() {
    let dir = TempDir::new().unwrap();
    let node = leader_node(&dir).await;
    for i in 0..5 {
        let resp = node
            .put(format!("gc/{}", i), b"v".to_vec(), String::new())
            .await;
        assert!(resp.success);
    }
    let applied = node.show_status().last_applied;
    assert!(applied >= 4);

    let resp = node.handle_clean_binlog(applied + 10);
    assert!(!resp.success);
    let resp = node.handle_clean_binlog(applied);
    assert!(resp.success);
    // the log tail is intact and the node still serves reads
    let resp = node.get("gc/4".into(), String::new()).await;
    assert!(resp.hit);
}
