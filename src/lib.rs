//! FileTalk chat and file sharing server
//!
//! A multi-user chat server over plain TCP. Clients authenticate with a
//! line-oriented protocol, then exchange chat lines, private messages and
//! files on the same connection.
//!
//! # Features
//! - LOGIN / REGISTER authentication with bounded retries
//! - Broadcast chat with recent history
//! - Private messages
//! - In-band file uploads and downloads (`SENDFILE` + length + payload)
//! - Forced disconnect and graceful shutdown
//!
//! # Architecture
//! - Each connection runs in its own task; a second task per connection
//!   drains the outbound queue onto the socket
//! - The [`Registry`] tracks authenticated sessions behind one lock
//! - The [`Router`] delivers broadcasts and private messages by pushing
//!   onto recipients' queues
//! - Users and messages live behind the [`UserStore`] and [`MessageStore`]
//!   traits (in-memory or SQLite)
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use filetalk::{ChatServer, Config, Storage};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(config.listen_addr()).await.unwrap();
//!     let server = ChatServer::new(config, Storage::in_memory());
//!     server.run(listener).await.unwrap();
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::Config;
pub use error::{AppError, AuthError, ConfigError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{ClientMessage, Envelope, ServerMessage};
pub use registry::Registry;
pub use router::Router;
pub use server::{ChatServer, ServerStatus};
pub use store::{MemoryStore, MessageStore, SqliteStore, Storage, UserStore};
pub use types::{hash_secret, Identity, SessionId, UserId};
