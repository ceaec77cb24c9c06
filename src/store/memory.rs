//! In-memory store, used by default and as the offline-mode fallback.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::message::{Envelope, StoredMessage};
use crate::store::{MessageStore, NewUser, UserStore};
use crate::types::{Identity, UserId};

/// Messages kept before the oldest are dropped
const MAX_RETAINED_MESSAGES: usize = 1000;

#[derive(Debug)]
struct UserRecord {
    id: UserId,
    handle: String,
    secret_hash: String,
    display_name: String,
}

#[derive(Debug, Default)]
struct MemoryInner {
    users: HashMap<String, UserRecord>,
    online: HashSet<UserId>,
    messages: VecDeque<StoredMessage>,
    next_user_id: i64,
    next_message_id: i64,
}

/// Users and messages behind one lock; each call is atomic
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for MemoryStore {
    fn authenticate(
        &self,
        handle: &str,
        secret_hash: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .users
            .get(handle)
            .filter(|u| u.secret_hash == secret_hash)
            .map(|u| Identity::new(u.id, u.handle.clone(), u.display_name.clone())))
    }

    fn exists(&self, handle: &str) -> Result<bool, StoreError> {
        Ok(self.lock().users.contains_key(handle))
    }

    fn create(&self, user: &NewUser) -> Result<Identity, StoreError> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.handle) {
            return Err(StoreError::HandleTaken(user.handle.clone()));
        }

        inner.next_user_id += 1;
        let id = UserId(inner.next_user_id);
        inner.users.insert(
            user.handle.clone(),
            UserRecord {
                id,
                handle: user.handle.clone(),
                secret_hash: user.secret_hash.clone(),
                display_name: user.display_name.clone(),
            },
        );
        Ok(Identity::new(id, user.handle.clone(), user.display_name.clone()))
    }

    fn set_online(&self, id: UserId, online: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if online {
            inner.online.insert(id);
        } else {
            inner.online.remove(&id);
        }
        Ok(())
    }

    fn list_online(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut online: Vec<&UserRecord> = inner
            .users
            .values()
            .filter(|u| inner.online.contains(&u.id))
            .collect();
        online.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(online.into_iter().map(|u| u.display_name.clone()).collect())
    }
}

impl MessageStore for MemoryStore {
    fn save(&self, envelope: &Envelope) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        inner.messages.push_back(StoredMessage {
            id,
            envelope: envelope.clone(),
        });
        if inner.messages.len() > MAX_RETAINED_MESSAGES {
            inner.messages.pop_front();
        }
        Ok(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock();
        let skip = inner.messages.len().saturating_sub(limit);
        Ok(inner.messages.iter().skip(skip).cloned().collect())
    }
}
