//! Authentication state machine
//!
//! Consumes lines before any other traffic on a connection and ends in
//! either an authenticated, registered session or a rejection.

use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{AppError, AuthError};
use crate::message::ServerMessage;
use crate::registry::Registry;
use crate::store::{NewUser, UserStore};
use crate::transport::LineReader;
use crate::types::{hash_secret, is_valid_handle, Identity};

/// One parsed pre-authentication line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `LOGIN <handle> <secret>`
    Login { handle: String, secret: String },
    /// `REGISTER <handle> <secret> <display name...>`
    Register {
        handle: String,
        secret: String,
        display_name: String,
    },
}

impl Credentials {
    pub fn parse(line: &str) -> Result<Self, AuthError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(verb) = tokens.first() else {
            return Err(AuthError::Malformed);
        };

        let credentials = match verb.to_ascii_uppercase().as_str() {
            "LOGIN" if tokens.len() == 3 => Credentials::Login {
                handle: tokens[1].to_string(),
                secret: tokens[2].to_string(),
            },
            "REGISTER" if tokens.len() >= 4 => Credentials::Register {
                handle: tokens[1].to_string(),
                secret: tokens[2].to_string(),
                display_name: tokens[3..].join(" "),
            },
            "LOGIN" | "REGISTER" => return Err(AuthError::Malformed),
            _ => return Err(AuthError::UnknownVerb(verb.to_string())),
        };

        if !is_valid_handle(credentials.handle()) {
            return Err(AuthError::InvalidHandle(credentials.handle().to_string()));
        }
        Ok(credentials)
    }

    pub fn handle(&self) -> &str {
        match self {
            Credentials::Login { handle, .. } | Credentials::Register { handle, .. } => handle,
        }
    }

    /// Check or create the identity against the user store
    pub fn verify(&self, users: &dyn UserStore) -> Result<Identity, AuthError> {
        match self {
            Credentials::Login { handle, secret } => users
                .authenticate(handle, &hash_secret(secret))?
                .ok_or(AuthError::BadCredentials),
            Credentials::Register {
                handle,
                secret,
                display_name,
            } => {
                if users.exists(handle)? {
                    return Err(AuthError::HandleTaken(handle.clone()));
                }
                let identity = users.create(&NewUser {
                    handle: handle.clone(),
                    secret_hash: hash_secret(secret),
                    display_name: display_name.clone(),
                })?;
                Ok(identity)
            }
        }
    }

    fn is_registration(&self) -> bool {
        matches!(self, Credentials::Register { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    AwaitingCredentials { failures: u32 },
    /// `registered` is true for a freshly created account
    Authenticated { identity: Identity, registered: bool },
    Rejected,
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState::AwaitingCredentials { failures: 0 }
    }
}

impl AuthState {
    /// Count one failed attempt; `max_attempts` failures reject
    pub fn fail(self, max_attempts: u32) -> Self {
        match self {
            AuthState::AwaitingCredentials { failures } => {
                let failures = failures + 1;
                if failures >= max_attempts {
                    AuthState::Rejected
                } else {
                    AuthState::AwaitingCredentials { failures }
                }
            }
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthState::AwaitingCredentials { .. })
    }
}

/// Run the state machine until it reaches a terminal state.
///
/// On success `client` carries the identity and is already in the
/// registry. Replies go through the client's outbound queue. Blank lines
/// are ignored and do not count as attempts.
pub async fn authenticate<R>(
    reader: &mut LineReader<R>,
    client: &mut Client,
    users: &dyn UserStore,
    registry: &Registry,
    max_attempts: u32,
) -> Result<AuthState, AppError>
where
    R: AsyncRead + Unpin,
{
    let mut state = AuthState::default();

    while !state.is_terminal() {
        let Some(line) = reader.read_line().await? else {
            debug!("Session {} closed before authenticating", client.session_id);
            return Ok(AuthState::Rejected);
        };
        if line.trim().is_empty() {
            continue;
        }

        match attempt(&line, client, users, registry) {
            Ok(next) => state = next,
            Err(e) => {
                warn!("Session {} auth failure: {}", client.session_id, e);
                state = state.fail(max_attempts);
                let reply = match state {
                    AuthState::Rejected => ServerMessage::Rejected,
                    _ => ServerMessage::Error(e.to_string()),
                };
                client.send(reply)?;
            }
        }
    }

    if let AuthState::Authenticated {
        identity,
        registered,
    } = &state
    {
        info!(
            "Session {} authenticated as {} ({})",
            client.session_id,
            identity.handle,
            if *registered { "new account" } else { "login" }
        );
    }
    Ok(state)
}

fn attempt(
    line: &str,
    client: &mut Client,
    users: &dyn UserStore,
    registry: &Registry,
) -> Result<AuthState, AuthError> {
    let credentials = Credentials::parse(line)?;
    let identity = credentials.verify(users)?;

    let mut candidate = client.clone();
    candidate.set_identity(identity.clone());
    registry.add(candidate.clone()).map_err(|e| match e {
        AppError::AlreadyOnline(handle) => AuthError::AlreadyOnline(handle),
        _ => AuthError::AlreadyOnline(identity.handle.clone()),
    })?;
    *client = candidate;

    Ok(AuthState::Authenticated {
        identity,
        registered: credentials.is_registration(),
    })
}
