//! Connection registry
//!
//! Process-wide table of authenticated sessions, keyed by user id with a
//! secondary handle index. Both maps live behind one lock so a reader never
//! observes an entry in one but not the other.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::client::Client;
use crate::error::AppError;
use crate::types::UserId;

#[derive(Debug, Default)]
struct RegistryInner {
    /// All authenticated sessions: UserId -> Client
    clients: HashMap<UserId, Client>,
    /// Handle index: handle -> UserId
    handles: HashMap<String, UserId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an authenticated session.
    ///
    /// Refused with `AlreadyOnline` when the id or handle is present, so a
    /// second concurrent login of the same identity never replaces the first.
    pub fn add(&self, client: Client) -> Result<(), AppError> {
        let (id, handle) = match client.identity.as_deref() {
            Some(identity) => (identity.id, identity.handle.clone()),
            None => return Err(AppError::NotAuthenticated),
        };

        let mut inner = self.lock();
        if inner.clients.contains_key(&id) || inner.handles.contains_key(&handle) {
            return Err(AppError::AlreadyOnline(handle));
        }

        inner.handles.insert(handle.clone(), id);
        inner.clients.insert(id, client);
        debug!("Registered {} as {} (online: {})", handle, id, inner.clients.len());
        Ok(())
    }

    /// Unregister a session; None when the id is absent
    pub fn remove(&self, id: UserId) -> Option<Client> {
        let mut inner = self.lock();
        let client = inner.clients.remove(&id)?;
        if let Some(handle) = client.handle() {
            inner.handles.remove(handle);
        }
        debug!("Unregistered {} (online: {})", id, inner.clients.len());
        Some(client)
    }

    pub fn lookup_by_id(&self, id: UserId) -> Option<Client> {
        self.lock().clients.get(&id).cloned()
    }

    pub fn lookup_by_handle(&self, handle: &str) -> Option<Client> {
        let inner = self.lock();
        let id = inner.handles.get(handle)?;
        inner.clients.get(id).cloned()
    }

    /// Display names of every registered session, ordered by handle
    pub fn list_online(&self) -> Vec<String> {
        let inner = self.lock();
        let mut handles: Vec<(&String, &UserId)> = inner.handles.iter().collect();
        handles.sort();
        handles
            .into_iter()
            .filter_map(|(_, id)| inner.clients.get(id))
            .map(|client| client.display_name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every registered session while holding the lock.
    ///
    /// `f` must not block; queue sends are the only intended work.
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Client),
    {
        let inner = self.lock();
        inner.clients.values().for_each(|client| f(client));
    }

    /// Force the session registered under `handle` to terminate.
    ///
    /// The session stays registered until its own cleanup runs.
    pub fn disconnect(&self, handle: &str, reason: &str) -> bool {
        match self.lookup_by_handle(handle) {
            Some(client) => {
                info!("Disconnecting {}: {}", handle, reason);
                client.disconnect(reason);
                true
            }
            None => false,
        }
    }
}
