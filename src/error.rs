//! Error types for the chat server
//!
//! Defines session-level errors, authentication failures, storage
//! collaborator errors, configuration errors and message send errors.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// recoverable errors (one error line sent to the client).
#[derive(Debug, Error)]
pub enum AppError {
    /// Stream read/write error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound line exceeded the configured maximum (fatal)
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The session's writer task stopped (fatal)
    #[error("Connection writer closed")]
    WriterClosed,

    /// The client stopped reading and its outbound queue filled up (fatal)
    #[error("Outbound queue full")]
    QueueFull,

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Slash-command nobody handles
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Known command with wrong arguments
    #[error("Usage: {0}")]
    Usage(&'static str),

    /// Operation needs an authenticated session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// A session for this identity is already registered
    #[error("Already online: {0}")]
    AlreadyOnline(String),

    /// Requested file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Requested path escapes the file directory or is not a regular file
    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    /// Transfer above the configured ceiling
    #[error("File too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    /// Local file system error during a transfer (not a stream error)
    #[error("File error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    /// Whether this error ends the session.
    ///
    /// Only transport failures are fatal; everything else is reported to
    /// the client as a single error line.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Io(_)
                | AppError::LineTooLong(_)
                | AppError::WriterClosed
                | AppError::QueueFull
        )
    }

    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::File {
            path: path.into(),
            source,
        }
    }
}

impl From<SendError> for AppError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::ChannelClosed => AppError::WriterClosed,
            SendError::QueueFull => AppError::QueueFull,
        }
    }
}

/// Reasons a LOGIN or REGISTER line is refused
///
/// Each one costs the connection one authentication attempt.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Usage: LOGIN <username> <password> or REGISTER <username> <password> <display_name>")]
    Malformed,

    #[error("Please LOGIN or REGISTER first (got {0})")]
    UnknownVerb(String),

    #[error("Invalid username: {0}")]
    InvalidHandle(String),

    #[error("Invalid username or password")]
    BadCredentials,

    #[error("Username already exists: {0}")]
    HandleTaken(String),

    #[error("User is already logged in: {0}")]
    AlreadyOnline(String),

    #[error("Authentication unavailable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HandleTaken(handle) => AuthError::HandleTaken(handle),
            other => AuthError::Store(other),
        }
    }
}

/// Storage collaborator errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Registration for a handle that already exists
    #[error("handle already taken: {0}")]
    HandleTaken(String),

    /// SQLite failure (transaction already rolled back)
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Message send errors
///
/// Occurs when a session's outbound queue is closed or full.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The client is not draining its queue
    #[error("Outbound queue full")]
    QueueFull,
}
