//! User registry and login table
//!
//! Registration and login travel through the replicated log, so the apply
//! loop on every replica runs the same mutation here. Credentials are
//! stored as a deterministic digest (replicas must converge byte-for-byte;
//! a salted hash would diverge). The login table (uuid -> username) is
//! process-local: a restarted node simply reports uuid_expired and the
//! client logs in again.

use crate::common::Result;
use crate::proto::RpcStatus;
use rocksdb::{Options, WriteOptions, DB};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

fn credential_digest(username: &str, passwd: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b"\n");
    hasher.update(passwd.as_bytes());
    hasher.finalize().to_vec()
}

/// Registered users (durable) plus live logins (in-memory)
pub struct UserManager {
    db: RwLock<DB>,
    logged_in: RwLock<HashMap<String, String>>,
}

impl UserManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, dir.as_ref())?;
        Ok(Self {
            db: RwLock::new(db),
            logged_in: RwLock::new(HashMap::new()),
        })
    }

    /// Mint the login token carried by a Login log entry
    pub fn calc_uuid() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn is_valid_user(&self, username: &str) -> bool {
        !username.is_empty()
            && self
                .db
                .read()
                .unwrap()
                .get(username.as_bytes())
                .ok()
                .flatten()
                .is_some()
    }

    /// Apply a Register entry
    pub fn register(&self, username: &str, passwd: &str) -> RpcStatus {
        if username.is_empty() {
            return RpcStatus::Error;
        }
        let db = self.db.read().unwrap();
        match db.get(username.as_bytes()) {
            Ok(Some(_)) => RpcStatus::UserExists,
            Ok(None) => {
                let mut opts = WriteOptions::default();
                opts.set_sync(true);
                match db.put_opt(
                    username.as_bytes(),
                    credential_digest(username, passwd),
                    &opts,
                ) {
                    Ok(()) => RpcStatus::Ok,
                    Err(_) => RpcStatus::Error,
                }
            }
            Err(_) => RpcStatus::Error,
        }
    }

    /// Apply a Login entry: verify the password and bind `uuid` to the user
    pub fn login(&self, username: &str, passwd: &str, uuid: &str) -> RpcStatus {
        let stored = match self.db.read().unwrap().get(username.as_bytes()) {
            Ok(Some(v)) => v,
            Ok(None) => return RpcStatus::UnknownUser,
            Err(_) => return RpcStatus::Error,
        };
        if stored != credential_digest(username, passwd) {
            return RpcStatus::PasswordError;
        }
        self.logged_in
            .write()
            .unwrap()
            .insert(uuid.to_string(), username.to_string());
        RpcStatus::Ok
    }

    /// Apply a Logout entry
    pub fn logout(&self, uuid: &str) -> RpcStatus {
        match self.logged_in.write().unwrap().remove(uuid) {
            Some(_) => RpcStatus::Ok,
            None => RpcStatus::UnknownUser,
        }
    }

    pub fn is_logged_in(&self, uuid: &str) -> bool {
        self.logged_in.read().unwrap().contains_key(uuid)
    }

    /// Username bound to `uuid`, empty (the anonymous user) when the uuid
    /// is empty or unknown
    pub fn username_from_uuid(&self, uuid: &str) -> String {
        if uuid.is_empty() {
            return String::new();
        }
        self.logged_in
            .read()
            .unwrap()
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Wipe the registry and login table (snapshot install)
    pub fn reset(&self) -> Result<()> {
        self.logged_in.write().unwrap().clear();
        let db = self.db.write().unwrap();
        let keys: Vec<Vec<u8>> = db
            .iterator(rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok().map(|(k, _)| k.to_vec()))
            .collect();
        for key in keys {
            db.delete(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_register_login_logout() {
        let dir = tempdir().unwrap();
        let users = UserManager::open(dir.path()).unwrap();

        assert_eq!(users.register("alice", "secret"), RpcStatus::Ok);
        assert_eq!(users.register("alice", "other"), RpcStatus::UserExists);
        assert!(users.is_valid_user("alice"));
        assert!(!users.is_valid_user("bob"));

        let uuid = UserManager::calc_uuid();
        assert_eq!(users.login("alice", "wrong", &uuid), RpcStatus::PasswordError);
        assert!(!users.is_logged_in(&uuid));
        assert_eq!(users.login("alice", "secret", &uuid), RpcStatus::Ok);
        assert!(users.is_logged_in(&uuid));
        assert_eq!(users.username_from_uuid(&uuid), "alice");

        assert_eq!(users.logout(&uuid), RpcStatus::Ok);
        assert!(!users.is_logged_in(&uuid));
        assert_eq!(users.logout(&uuid), RpcStatus::UnknownUser);
    }

    #[test]
    fn test_login_unknown_user() {
        let dir = tempdir().unwrap();
        let users = UserManager::open(dir.path()).unwrap();
        assert_eq!(
            users.login("ghost", "pw", "u-1"),
            RpcStatus::UnknownUser
        );
    }

    #[test]
    fn test_registry_survives_reopen_logins_do_not() {
        let dir = tempdir().unwrap();
        let uuid = UserManager::calc_uuid();
        {
            let users = UserManager::open(dir.path()).unwrap();
            users.register("alice", "secret");
            users.login("alice", "secret", &uuid);
        }
        let users = UserManager::open(dir.path()).unwrap();
        assert!(users.is_valid_user("alice"));
        assert!(!users.is_logged_in(&uuid));
    }

    #[test]
    fn test_reset_clears_registry() {
        let dir = tempdir().unwrap();
        let users = UserManager::open(dir.path()).unwrap();
        users.register("alice", "secret");
        users.reset().unwrap();
        assert!(!users.is_valid_user("alice"));
        assert_eq!(users.register("alice", "again"), RpcStatus::Ok);
    }
}
