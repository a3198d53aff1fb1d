//! Client session table
//!
//! A session is a lease: the client refreshes it with KeepAlive and it
//! expires `session_expire_timeout` after the last refresh. The table is
//! indexed both by session id and by expiry time so the sweeper can pop
//! everything past a deadline without a full walk. Sessions are not
//! replicated; a new leader relearns them from client KeepAlives.

use std::collections::{BTreeSet, HashMap};

/// One client lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    /// Login token the session runs under, empty for anonymous
    pub uuid: String,
    /// Expiry deadline, microseconds since epoch
    pub expiry_us: i64,
}

/// Live sessions, indexed by id and by expiry
#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<String, Session>,
    by_expiry: BTreeSet<(i64, String)>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a session
    pub fn upsert(&mut self, session: Session) {
        if let Some(old) = self.by_id.remove(&session.session_id) {
            self.by_expiry.remove(&(old.expiry_us, old.session_id));
        }
        self.by_expiry
            .insert((session.expiry_us, session.session_id.clone()));
        self.by_id.insert(session.session_id.clone(), session);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.by_id.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Remove and return every session expired at `now_us`
    pub fn remove_expired(&mut self, now_us: i64) -> Vec<Session> {
        let mut expired = Vec::new();
        while let Some((expiry, id)) = self.by_expiry.first().cloned() {
            if expiry >= now_us {
                break;
            }
            self.by_expiry.remove(&(expiry, id.clone()));
            if let Some(session) = self.by_id.remove(&id) {
                expired.push(session);
            }
        }
        expired
    }
}
