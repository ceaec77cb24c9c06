//! SQLite store for users and messages.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::message::{Envelope, StoredMessage};
use crate::store::{MessageStore, NewUser, UserStore};
use crate::types::{Identity, UserId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        display_name TEXT NOT NULL,
        is_online INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        message_id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id INTEGER REFERENCES users(user_id),
        sender_name TEXT NOT NULL,
        message_text TEXT NOT NULL,
        message_type TEXT NOT NULL DEFAULT 'text',
        sent_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
    CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::init(Connection::open(path.as_ref())?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        // Nobody is connected to a process that just started
        conn.execute("UPDATE users SET is_online = 0 WHERE is_online <> 0", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl UserStore for SqliteStore {
    fn authenticate(
        &self,
        handle: &str,
        secret_hash: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT user_id, username, password_hash, display_name
                 FROM users WHERE username = ?1",
                params![handle],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row
            .filter(|(_, _, hash, _)| hash == secret_hash)
            .map(|(id, handle, _, display_name)| Identity::new(UserId(id), handle, display_name)))
    }

    fn exists(&self, handle: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![handle],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn create(&self, user: &NewUser) -> Result<Identity, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![user.handle],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::HandleTaken(user.handle.clone()));
        }

        tx.execute(
            "INSERT INTO users (username, password_hash, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.handle, user.secret_hash, user.display_name, now_millis()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Identity::new(
            UserId(id),
            user.handle.clone(),
            user.display_name.clone(),
        ))
    }

    fn set_online(&self, id: UserId, online: bool) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE users SET is_online = ?1, last_seen = ?2 WHERE user_id = ?3",
            params![online, now_millis(), id.0],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_online(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT display_name FROM users WHERE is_online = 1 ORDER BY username",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

impl MessageStore for SqliteStore {
    fn save(&self, envelope: &Envelope) -> Result<i64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (sender_id, sender_name, message_text, message_type, sent_at)
             VALUES (?1, ?2, ?3, 'text', ?4)",
            params![
                envelope.sender_id.map(|id| id.0),
                envelope.sender,
                envelope.text,
                envelope.sent_at.timestamp_millis(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT message_id, sender_id, sender_name, message_text, sent_at
             FROM messages ORDER BY message_id DESC LIMIT ?1",
        )?;
        let mut messages = stmt
            .query_map(params![limit as i64], |row| {
                let sent_at: i64 = row.get(4)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    envelope: Envelope {
                        sent_at: Utc
                            .timestamp_millis_opt(sent_at)
                            .single()
                            .unwrap_or_default(),
                        sender_id: row.get::<_, Option<i64>>(1)?.map(UserId),
                        sender: row.get(2)?,
                        text: row.get(3)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}
