//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based identifier for one accepted connection
//! - `UserId`: store-assigned identifier of a registered user
//! - `Identity`: the authenticated user bound to a session

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Longest accepted login handle
pub const MAX_HANDLE_LEN: usize = 32;

/// Unique connection identifier (newtype pattern)
///
/// Assigned when a connection is accepted, before authentication.
/// Used for logging and to tell two sessions of the same user apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered user identifier, assigned by the user store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An authenticated user
///
/// Produced by the user store on a successful login or registration and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    /// Unique login name
    pub handle: String,
    pub display_name: String,
    pub authenticated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: UserId, handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            handle: handle.into(),
            display_name: display_name.into(),
            authenticated_at: Utc::now(),
        }
    }
}

/// Hash a login secret for storage and comparison.
///
/// Deterministic and one-way, but unsalted: not a password KDF.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"filetalk-secret-v1:");
    hasher.update(secret.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Check that a handle is usable as a login name and as a directory name.
pub fn is_valid_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle.len() <= MAX_HANDLE_LEN
        && handle != "."
        && handle != ".."
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
