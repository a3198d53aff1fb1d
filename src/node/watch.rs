//! One-shot key watches
//!
//! A watch parks the client's RPC until the watched key changes, then fires
//! exactly once and is removed. Events are double-indexed: by (bound) key,
//! so an applied change can fire everyone watching it, and by session, so
//! an expired session drops its watches. Watches are process-local, like
//! sessions.

use crate::proto::WatchResponse;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;

/// A parked watch RPC
pub struct WatchEvent {
    /// Bound key, `user::key`
    pub key: String,
    pub session_id: String,
    pub sender: oneshot::Sender<WatchResponse>,
}

/// Registered watches, indexed by key and by session
#[derive(Default)]
pub struct WatchTable {
    events: HashMap<u64, WatchEvent>,
    by_key: HashMap<String, BTreeSet<u64>>,
    by_session: HashMap<String, BTreeSet<u64>>,
    next_id: u64,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn unlink(&mut self, id: u64) -> Option<WatchEvent> {
        let event = self.events.remove(&id)?;
        if let Some(set) = self.by_key.get_mut(&event.key) {
            set.remove(&id);
            if set.is_empty() {
                self.by_key.remove(&event.key);
            }
        }
        if let Some(set) = self.by_session.get_mut(&event.session_id) {
            set.remove(&id);
            if set.is_empty() {
                self.by_session.remove(&event.session_id);
            }
        }
        Some(event)
    }

    /// Register a watch. A prior watch of the same session on the same key
    /// is removed and returned so the caller can complete it as canceled.
    pub fn insert(
        &mut self,
        key: String,
        session_id: String,
        sender: oneshot::Sender<WatchResponse>,
    ) -> Vec<WatchEvent> {
        let replaced = self.take_by_session_and_key(&session_id, &key);

        let id = self.next_id;
        self.next_id += 1;
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.by_session
            .entry(session_id.clone())
            .or_default()
            .insert(id);
        self.events.insert(
            id,
            WatchEvent {
                key,
                session_id,
                sender,
            },
        );
        replaced
    }

    /// Remove and return every watch on `key`
    pub fn take_by_key(&mut self, key: &str) -> Vec<WatchEvent> {
        let ids: Vec<u64> = self
            .by_key
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.unlink(id)).collect()
    }

    /// Remove and return every watch held by `session_id`
    pub fn take_by_session(&mut self, session_id: &str) -> Vec<WatchEvent> {
        let ids: Vec<u64> = self
            .by_session
            .get(session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.unlink(id)).collect()
    }

    /// Remove and return `session_id`'s watches on `key`
    pub fn take_by_session_and_key(&mut self, session_id: &str, key: &str) -> Vec<WatchEvent> {
        let ids: Vec<u64> = self
            .by_session
            .get(session_id)
            .map(|set| {
                set.iter()
                    .copied()
                    .filter(|id| self.events.get(id).map(|e| e.key == key).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.unlink(id)).collect()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(table: &mut WatchTable, key: &str, session: &str) -> oneshot::Receiver<WatchResponse> {
        let (tx, rx) = oneshot::channel();
        let replaced = table.insert(key.to_string(), session.to_string(), tx);
        assert!(replaced.is_empty());
        rx
    }

    #[test]
    fn test_fire_removes_watch() {
        let mut table = WatchTable::new();
        let _rx = register(&mut table, "anonymous::k", "s1");
        assert!(table.has_key("anonymous::k"));

        let events = table.take_by_key("anonymous::k");
        assert_eq!(events.len(), 1);
        assert!(table.is_empty());
        // second take finds nothing: one-shot
        assert!(table.take_by_key("anonymous::k").is_empty());
    }

    #[test]
    fn test_both_indexes_stay_consistent() {
        let mut table = WatchTable::new();
        let _rx1 = register(&mut table, "anonymous::a", "s1");
        let _rx2 = register(&mut table, "anonymous::b", "s1");
        let _rx3 = register(&mut table, "anonymous::a", "s2");

        let dropped = table.take_by_session("s1");
        assert_eq!(dropped.len(), 2);
        assert_eq!(table.len(), 1);
        // s2's watch on "a" must have survived s1's removal
        let events = table.take_by_key("anonymous::a");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "s2");
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut table = WatchTable::new();
        let (tx1, mut rx1) = oneshot::channel();
        table.insert("anonymous::k".to_string(), "s1".to_string(), tx1);
        let (tx2, _rx2) = oneshot::channel();
        let replaced = table.insert("anonymous::k".to_string(), "s1".to_string(), tx2);
        assert_eq!(replaced.len(), 1);
        assert_eq!(table.len(), 1);
        drop(replaced);
        // the replaced sender is gone, so the first receiver errors out
        assert!(rx1.try_recv().is_err());
    }
}
