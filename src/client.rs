//! Client struct definition
//!
//! Represents a connected client with their state and communication channel.
//! A `Client` is a cheap handle: clones share the outbound queue, the
//! liveness flag and the disconnect signal of one session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::futures::Notified;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::transfer::OutgoingFile;
use crate::transport::Outbound;
use crate::types::{Identity, SessionId, UserId};

/// Connected client information
///
/// Holds the session ID, the identity once authenticated, and the
/// server → client queue drained by the session's writer task.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for this connection
    pub session_id: SessionId,
    /// Authenticated user (None before login)
    pub identity: Option<Arc<Identity>>,
    /// Server → Client queue, bounded
    sender: mpsc::Sender<Outbound>,
    /// Cleared when the session ends
    alive: Arc<AtomicBool>,
    /// Forced disconnect signal
    kick: Arc<Notify>,
}

impl Client {
    /// Create a new client with the given ID and sender channel
    pub fn new(session_id: SessionId, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            session_id,
            identity: None,
            sender,
            alive: Arc::new(AtomicBool::new(true)),
            kick: Arc::new(Notify::new()),
        }
    }

    /// Queue a message for this client
    ///
    /// Never blocks. Fails with `QueueFull` when the client has stopped
    /// reading and its queue is at capacity, or `ChannelClosed` once the
    /// writer task is gone.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.push(Outbound::Message(msg))
    }

    /// Queue a file download behind everything already queued
    pub fn send_file(&self, file: OutgoingFile) -> Result<(), SendError> {
        self.push(Outbound::File(file))
    }

    fn push(&self, item: Outbound) -> Result<(), SendError> {
        self.sender.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Get the display name for this client
    ///
    /// Returns the identity's display name if authenticated, otherwise "Unknown".
    pub fn display_name(&self) -> &str {
        self.identity
            .as_deref()
            .map(|i| i.display_name.as_str())
            .unwrap_or("Unknown")
    }

    pub fn handle(&self) -> Option<&str> {
        self.identity.as_deref().map(|i| i.handle.as_str())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.identity.as_deref().map(|i| i.id)
    }

    /// Bind the authenticated identity to this session
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(Arc::new(identity));
    }

    /// Check if the session behind this handle is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Force this session to terminate
    ///
    /// The reason is queued as the last line the client receives when the
    /// queue has room; the signal fires either way.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.send(ServerMessage::Disconnecting(reason.into()));
        self.kick.notify_one();
    }

    /// Resolves once `disconnect` has been called on any clone
    pub fn kicked(&self) -> Notified<'_> {
        self.kick.notified()
    }
}
