//! Server configuration.
//!
//! Read from a TOML file when present, then overridden from the
//! environment (`.env` is loaded by `main` before this runs).

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address to bind
    pub bind: String,

    /// Port to listen on
    pub port: u16,

    /// Root for uploads (`<dir>/<handle>/<name>`) and `/sendfile` downloads
    pub files_dir: PathBuf,

    /// Largest file accepted or served, in bytes
    pub max_file_size: u64,

    /// Transfer chunk size in bytes
    pub chunk_size: usize,

    /// Transfers above this size report progress
    pub progress_threshold: u64,

    /// Failed LOGIN/REGISTER lines before the connection is closed
    pub max_auth_attempts: u32,

    /// Longest accepted protocol line in bytes
    pub max_line_length: usize,

    /// Messages returned by `/history`
    pub history_limit: usize,

    /// Messages queued per session before a non-reading client is dropped
    pub outbound_queue_len: usize,

    /// Seconds to wait for sessions to finish on shutdown
    pub shutdown_grace_secs: u64,

    /// SQLite database; in-memory storage when unset
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            files_dir: PathBuf::from("uploads"),
            max_file_size: 100 * 1024 * 1024,
            chunk_size: 8 * 1024,
            progress_threshold: 1024 * 1024,
            max_auth_attempts: 3,
            max_line_length: 64 * 1024,
            history_limit: 20,
            outbound_queue_len: 256,
            shutdown_grace_secs: 5,
            database_path: None,
        }
    }
}

impl Config {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Apply `PORT`, `FILETALK_BIND`, `FILETALK_FILES_DIR` and `DATABASE_PATH`
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "PORT",
                value: port,
            })?;
        }
        if let Some(bind) = var("FILETALK_BIND") {
            self.bind = bind;
        }
        if let Some(dir) = var("FILETALK_FILES_DIR") {
            self.files_dir = PathBuf::from(dir);
        }
        if let Some(db) = var("DATABASE_PATH") {
            self.database_path = (!db.is_empty()).then(|| PathBuf::from(db));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        if let Ok(addr) = self.bind.parse::<SocketAddr>() {
            return addr.to_string();
        }
        match self.bind.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.bind, self.port),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
