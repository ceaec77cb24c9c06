//! ChatServer implementation
//!
//! Owns the state shared by every session: configuration, the connection
//! registry, the message router and the storage collaborators. Runs the
//! accept loop and coordinates shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::registry::Registry;
use crate::router::Router;
use crate::store::Storage;
use crate::transfer::TransferLimits;

/// State shared by the server and every session it spawns
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) limits: TransferLimits,
    pub(crate) registry: Arc<Registry>,
    pub(crate) router: Router,
    pub(crate) storage: Storage,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    started_at: DateTime<Utc>,
}

/// Snapshot returned by [`ChatServer::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub online: usize,
    pub users: Vec<String>,
    pub offline_storage: bool,
    pub started_at: DateTime<Utc>,
}

/// The chat server
///
/// Cheap to clone; every clone drives the same server.
#[derive(Clone)]
pub struct ChatServer {
    shared: Arc<Shared>,
}

impl ChatServer {
    pub fn new(config: Config, storage: Storage) -> Self {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone(), storage.messages.clone(), !storage.offline);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                limits: TransferLimits::from(&config),
                config,
                registry,
                router,
                storage,
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                started_at: Utc::now(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// Receiver to hand to [`handle_connection`]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shared.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Sessions still running after shutdown get the configured grace
    /// period to finish before they are aborted.
    pub async fn run(&self, listener: TcpListener) -> Result<(), AppError> {
        let mut shutdown_rx = self.subscribe_shutdown();
        let mut sessions = JoinSet::new();

        if let Ok(addr) = listener.local_addr() {
            info!("FileTalk server listening on {}", addr);
        }

        while !self.is_shutting_down() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", addr, e);
                        }
                        let server = self.clone();
                        let shutdown = self.subscribe_shutdown();
                        sessions.spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, addr.to_string(), server, shutdown).await
                            {
                                debug!("Connection handler error for {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        drop(listener);
        info!("Stopped accepting; waiting for {} sessions", sessions.len());

        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shared.config.shutdown_grace(), drain)
            .await
            .is_err()
        {
            warn!(
                "{} sessions still running after grace period, aborting",
                sessions.len()
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Server stopped");
        Ok(())
    }

    /// Stop accepting and tell every session to finish
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutdown requested ({} online)", self.shared.registry.len());
        let _ = self.shared.shutdown_tx.send(());
    }

    /// Force the session logged in as `handle` to disconnect
    pub fn kick(&self, handle: &str, reason: &str) -> bool {
        self.shared.registry.disconnect(handle, reason)
    }

    /// Server notice to every session
    pub fn announce(&self, text: &str) -> usize {
        info!("Server message broadcast: {}", text);
        self.shared.router.announce(text, None)
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            online: self.shared.registry.len(),
            users: self.shared.registry.list_online(),
            offline_storage: self.shared.storage.offline,
            started_at: self.shared.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_status_of_fresh_server() {
        let server = ChatServer::new(Config::default(), Storage::in_memory());
        let status = server.status();

        assert_eq!(status.online, 0);
        assert!(status.users.is_empty());
        assert!(!status.offline_storage);
        assert!(!server.is_shutting_down());
    }

    #[test]
    fn test_kick_unknown_handle() {
        let server = ChatServer::new(Config::default(), Storage::in_memory());
        assert!(!server.kick("nobody", "bye"));
        assert_eq!(server.announce("hello"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns() {
        let server = ChatServer::new(Config::default(), Storage::in_memory());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        server.shutdown();
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server.run(listener))
            .await
            .unwrap()
            .unwrap();
    }
}
