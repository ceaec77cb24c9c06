//! Message router
//!
//! Broadcast and private delivery over the registry. Every delivery is a
//! non-blocking push onto the recipient's outbound queue, so a slow client
//! never holds up the sender or the registry lock.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::client::Client;
use crate::error::SendError;
use crate::message::{Envelope, ServerMessage};
use crate::registry::Registry;
use crate::store::MessageStore;
use crate::types::UserId;

/// Reason given to a session dropped for not draining its queue
const STALLED_REASON: &str = "Too many undelivered messages";

#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    messages: Arc<dyn MessageStore>,
    /// False in offline mode
    persist: bool,
}

impl Router {
    pub fn new(registry: Arc<Registry>, messages: Arc<dyn MessageStore>, persist: bool) -> Self {
        Self {
            registry,
            messages,
            persist,
        }
    }

    /// Chat text from `sender_id` to every session except `exclude`.
    ///
    /// The envelope is recorded before delivery; a store failure is logged
    /// and delivery proceeds. Returns the number of sessions reached.
    pub fn broadcast(&self, text: &str, sender_id: UserId, exclude: Option<UserId>) -> usize {
        let Some(sender) = self.registry.lookup_by_id(sender_id) else {
            warn!("Broadcast from unregistered user {}", sender_id);
            return 0;
        };

        let envelope = Envelope::chat(sender_id, sender.display_name(), text);
        if self.persist {
            if let Err(e) = self.messages.save(&envelope) {
                error!("Failed to save message from {}: {}", sender_id, e);
            }
        }

        self.deliver(ServerMessage::Chat(envelope), exclude)
    }

    /// Server notice to every session except `exclude`; not recorded
    pub fn announce(&self, text: &str, exclude: Option<UserId>) -> usize {
        self.deliver(ServerMessage::Notice(Envelope::notice(text)), exclude)
    }

    /// Deliver `text` to `to_handle` and confirm to `from_handle`.
    ///
    /// An offline recipient is a silent no-op. Returns whether the
    /// recipient's queue accepted the message.
    pub fn private_message(&self, from_handle: &str, to_handle: &str, text: &str) -> bool {
        let Some(recipient) = self.registry.lookup_by_handle(to_handle) else {
            debug!("Private message from {} to offline {}", from_handle, to_handle);
            return false;
        };
        let Some(sender) = self.registry.lookup_by_handle(from_handle) else {
            return false;
        };
        let Some(sender_id) = sender.user_id() else {
            return false;
        };

        let envelope = Envelope::chat(sender_id, sender.display_name(), text);
        if !push(&recipient, ServerMessage::PrivateReceived(envelope.clone())) {
            return false;
        }

        let _ = sender.send(ServerMessage::PrivateSent {
            envelope,
            to: to_handle.to_string(),
        });
        true
    }

    fn deliver(&self, msg: ServerMessage, exclude: Option<UserId>) -> usize {
        let mut delivered = 0;
        self.registry.for_each(|client| {
            if exclude.is_some() && client.user_id() == exclude {
                return;
            }
            if !client.is_alive() {
                debug!("Skipping ended session {}", client.session_id);
                return;
            }
            if push(client, msg.clone()) {
                delivered += 1;
            }
        });
        delivered
    }
}

/// Queue `msg` for one recipient; a recipient that stopped reading is
/// disconnected.
fn push(client: &Client, msg: ServerMessage) -> bool {
    match client.send(msg) {
        Ok(()) => true,
        Err(SendError::QueueFull) => {
            warn!(
                "Outbound queue of {} is full, disconnecting",
                client.handle().unwrap_or("unknown")
            );
            client.disconnect(STALLED_REASON);
            false
        }
        Err(SendError::ChannelClosed) => {
            debug!("Skipping closed session {}", client.session_id);
            false
        }
    }
}
