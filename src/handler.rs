//! Connection handler
//!
//! Drives one client connection: authentication, then the command loop.
//! The stream is split once; the session task owns the read half and a
//! writer task owns the write half, fed by the client's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthState};
use crate::client::Client;
use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::server::{ChatServer, Shared};
use crate::transfer;
use crate::transport::{self, LineReader, LineWriter};
use crate::types::{Identity, SessionId};

/// How long the writer may take to flush after the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a new connection
///
/// Runs until the client leaves, the connection fails, the session is
/// kicked, or the server shuts down. Cleanup happens on every one of
/// those paths.
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    server: ChatServer,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let shared = server.shared().clone();
    let session_id = SessionId::new();
    info!("Client {} connected from {}", session_id, peer);

    let (read_half, write_half) = tokio::io::split(stream);
    let (msg_tx, msg_rx) = mpsc::channel(shared.config.outbound_queue_len.max(1));

    let mut write_task = tokio::spawn(transport::write_loop(
        LineWriter::new(write_half),
        msg_rx,
        shared.limits,
    ));

    let mut client = Client::new(session_id, msg_tx);
    let control = client.clone();
    let mut reader = LineReader::new(read_half, shared.config.max_line_length);
    let mut writer_done = false;

    let result = {
        let session = run_session(&mut reader, &mut client, &shared);
        tokio::pin!(session);

        tokio::select! {
            result = &mut session => result,
            _ = control.kicked() => {
                info!("Client {} disconnected by server", session_id);
                Ok(())
            }
            _ = shutdown.recv() => {
                let _ = control.send(ServerMessage::Disconnecting(
                    "Server is shutting down".to_string(),
                ));
                Ok(())
            }
            joined = &mut write_task => {
                writer_done = true;
                match joined {
                    Ok(Ok(())) => Err(AppError::WriterClosed),
                    Ok(Err(e)) => Err(e),
                    Err(e) => {
                        error!("Writer task for {} failed: {}", session_id, e);
                        Err(AppError::WriterClosed)
                    }
                }
            }
        }
    };

    // The session future (and its registration) is gone; drop the last
    // queue handles so the writer drains and exits.
    drop(client);
    drop(control);

    if !writer_done {
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("Writer for {} ended: {}", session_id, e),
            Ok(Err(e)) => error!("Writer task for {} failed: {}", session_id, e),
            Err(_) => {
                warn!("Writer for {} did not drain in time", session_id);
                write_task.abort();
            }
        }
    }

    match &result {
        Ok(()) => info!("Client {} disconnected", session_id),
        Err(e) => info!("Client {} disconnected: {}", session_id, e),
    }
    result
}

/// Keeps a session registered; dropping it runs the leave cleanup
struct Registration {
    shared: Arc<Shared>,
    client: Client,
    identity: Identity,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.client.mark_closed();
        let id = self.identity.id;

        if self.shared.registry.remove(id).is_none() {
            warn!("{} was not registered at cleanup", self.identity.handle);
        }
        if let Err(e) = self.shared.storage.users.set_online(id, false) {
            warn!("Failed to mark {} offline: {}", self.identity.handle, e);
        }
        self.shared
            .router
            .announce(&format!("{} left the chat", self.identity.display_name), Some(id));

        info!(
            "{} left (online: {})",
            self.identity.handle,
            self.shared.registry.len()
        );
    }
}

enum Flow {
    Continue,
    Exit,
}

async fn run_session<R>(
    reader: &mut LineReader<R>,
    client: &mut Client,
    shared: &Arc<Shared>,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    client.send(ServerMessage::Welcome)?;

    let state = auth::authenticate(
        reader,
        client,
        shared.storage.users.as_ref(),
        &shared.registry,
        shared.config.max_auth_attempts,
    )
    .await?;

    let AuthState::Authenticated {
        identity,
        registered,
    } = state
    else {
        info!("Client {} rejected", client.session_id);
        return Ok(());
    };

    let _registration = Registration {
        shared: shared.clone(),
        client: client.clone(),
        identity: identity.clone(),
    };

    if let Err(e) = shared.storage.users.set_online(identity.id, true) {
        warn!("Failed to mark {} online: {}", identity.handle, e);
    }

    let display_name = identity.display_name.clone();
    client.send(if registered {
        ServerMessage::Registered {
            display_name: display_name.clone(),
        }
    } else {
        ServerMessage::LoggedIn {
            display_name: display_name.clone(),
        }
    })?;
    client.send(ServerMessage::Greeting { display_name })?;
    client.send(ServerMessage::OnlineUsers(shared.registry.list_online()))?;
    shared.router.announce(
        &format!("{} joined the chat", identity.display_name),
        Some(identity.id),
    );

    while let Some(line) = reader.read_line().await? {
        let msg = match ClientMessage::parse(&line) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                client.send(e.into())?;
                continue;
            }
        };

        match dispatch(msg, reader, client, shared, &identity).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("{}: {}", identity.handle, e);
                client.send(e.into())?;
            }
        }
    }

    debug!("{} closed the connection", identity.handle);
    Ok(())
}

async fn dispatch<R>(
    msg: ClientMessage,
    reader: &mut LineReader<R>,
    client: &Client,
    shared: &Shared,
    identity: &Identity,
) -> Result<Flow, AppError>
where
    R: AsyncRead + Unpin,
{
    match msg {
        ClientMessage::Help => client.send(ServerMessage::Help)?,
        ClientMessage::Users => {
            client.send(ServerMessage::OnlineUsers(shared.registry.list_online()))?
        }
        ClientMessage::Private { to, text } => {
            shared.router.private_message(&identity.handle, &to, &text);
        }
        ClientMessage::SendFile { path } => {
            let file =
                transfer::resolve_download(&shared.config.files_dir, &path, &shared.limits).await?;
            info!("{} requested {} ({} bytes)", identity.handle, file.name, file.size);

            let name = file.name.clone();
            client.send(ServerMessage::SendingFile {
                name: name.clone(),
                size: file.size,
            })?;
            client.send_file(file)?;
            shared.router.announce(
                &format!("{} is sharing file: {}", identity.display_name, name),
                Some(identity.id),
            );
        }
        ClientMessage::History => {
            let messages = shared.storage.messages.recent(shared.config.history_limit)?;
            client.send(ServerMessage::History(messages))?;
        }
        ClientMessage::WhoAmI => client.send(ServerMessage::WhoAmI {
            display_name: identity.display_name.clone(),
            handle: identity.handle.clone(),
        })?,
        ClientMessage::IncomingFile { name } => {
            let dest = shared.config.files_dir.join(&identity.handle);
            let received = transfer::receive_file(reader, &name, &dest, &shared.limits, |msg| {
                let _ = client.send(msg);
            })
            .await?;
            info!(
                "{} uploaded {} ({} bytes)",
                identity.handle,
                received.path.display(),
                received.descriptor.transferred
            );
        }
        ClientMessage::Exit => {
            client.send(ServerMessage::Disconnecting("Goodbye!".to_string()))?;
            return Ok(Flow::Exit);
        }
        ClientMessage::Chat(text) => {
            shared.router.broadcast(&text, identity.id, None);
        }
    }
    Ok(Flow::Continue)
}
