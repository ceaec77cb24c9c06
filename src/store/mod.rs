//! Storage collaborators
//!
//! The session layer only sees the [`UserStore`] and [`MessageStore`]
//! traits. Both are synchronous: a slow store stalls the calling session
//! only. Every write runs as one transaction that is either committed in
//! full or rolled back.

mod memory;
mod sqlite;

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::error::StoreError;
use crate::message::{Envelope, StoredMessage};
use crate::types::{Identity, UserId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A registration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub handle: String,
    pub secret_hash: String,
    pub display_name: String,
}

/// User accounts and their online flag
pub trait UserStore: Send + Sync {
    /// Identity for a matching (handle, secret hash) pair
    fn authenticate(&self, handle: &str, secret_hash: &str)
        -> Result<Option<Identity>, StoreError>;

    fn exists(&self, handle: &str) -> Result<bool, StoreError>;

    /// Insert a new user; `HandleTaken` if the handle exists
    fn create(&self, user: &NewUser) -> Result<Identity, StoreError>;

    fn set_online(&self, id: UserId, online: bool) -> Result<(), StoreError>;

    /// Display names of users flagged online
    fn list_online(&self) -> Result<Vec<String>, StoreError>;
}

/// Durable record of broadcast messages
pub trait MessageStore: Send + Sync {
    /// Record an envelope, returning its message id
    fn save(&self, envelope: &Envelope) -> Result<i64, StoreError>;

    /// Up to `limit` most recent messages, oldest first
    fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}

/// The store instances handed to the server at construction
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn UserStore>,
    pub messages: Arc<dyn MessageStore>,
    /// True when a configured database could not be opened
    pub offline: bool,
}

impl Storage {
    /// Volatile storage, nothing survives a restart
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            users: store.clone(),
            messages: store,
            offline: false,
        }
    }

    /// SQLite when a database path is configured, memory otherwise.
    ///
    /// A database that cannot be opened degrades the server to offline
    /// mode instead of failing startup.
    pub fn open(config: &Config) -> Self {
        let Some(path) = &config.database_path else {
            info!("No database configured, using in-memory storage");
            return Self::in_memory();
        };

        match SqliteStore::open(path) {
            Ok(store) => {
                info!("Database opened at {}", path.display());
                let store = Arc::new(store);
                Self {
                    users: store.clone(),
                    messages: store,
                    offline: false,
                }
            }
            Err(e) => {
                error!(
                    "Database {} unavailable ({}) - running in offline mode",
                    path.display(),
                    e
                );
                Self {
                    offline: true,
                    ..Self::in_memory()
                }
            }
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("offline", &self.offline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopenable_database_falls_back_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            // A directory is not a database file
            database_path: Some(dir.path().to_path_buf()),
            ..Config::default()
        };

        let storage = Storage::open(&config);
        assert!(storage.offline);

        let user = NewUser {
            handle: "alice".into(),
            secret_hash: "h".into(),
            display_name: "Alice".into(),
        };
        assert!(storage.users.create(&user).is_ok());
    }

    #[test]
    fn test_no_database_is_not_offline() {
        let storage = Storage::open(&Config::default());
        assert!(!storage.offline);
    }
}
