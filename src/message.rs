//! Line protocol definitions
//!
//! Inbound lines are parsed into [`ClientMessage`] values; everything the
//! server writes back is a [`ServerMessage`], rendered to text lines by its
//! `Display` implementation.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};

use crate::error::AppError;
use crate::types::UserId;

/// First word of a line announcing an in-band binary payload
pub const CONTROL_TOKEN: &str = "SENDFILE";

/// Keyword that ends a session gracefully (case-insensitive)
pub const EXIT_KEYWORD: &str = "exit";

/// Client → Server message
///
/// One parsed post-authentication line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `/help`
    Help,
    /// `/users` or `/online`
    Users,
    /// `/msg <handle> <text>` or `/pm <handle> <text>`
    Private { to: String, text: String },
    /// `/sendfile <path>`: download a file from the server
    SendFile { path: String },
    /// `/history`
    History,
    /// `/whoami`
    WhoAmI,
    /// `SENDFILE <name>`: a binary payload follows on the stream
    IncomingFile { name: String },
    /// `exit`
    Exit,
    /// Anything else: broadcast chat text
    Chat(String),
}

impl ClientMessage {
    /// Classify one inbound line.
    ///
    /// Returns `Ok(None)` for blank lines. Unknown slash-commands and
    /// missing arguments are errors the session reports locally.
    pub fn parse(line: &str) -> Result<Option<Self>, AppError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(command) = line.strip_prefix('/') {
            return Self::parse_command(command).map(Some);
        }

        let (first, rest) = split_word(line);
        if first == CONTROL_TOKEN {
            return Ok(Some(ClientMessage::IncomingFile {
                name: rest.to_string(),
            }));
        }

        if line.eq_ignore_ascii_case(EXIT_KEYWORD) {
            return Ok(Some(ClientMessage::Exit));
        }

        Ok(Some(ClientMessage::Chat(line.to_string())))
    }

    fn parse_command(command: &str) -> Result<Self, AppError> {
        let (name, args) = split_word(command);
        match name.to_ascii_lowercase().as_str() {
            "help" => Ok(ClientMessage::Help),
            "users" | "online" => Ok(ClientMessage::Users),
            "msg" | "pm" => {
                let (to, text) = split_word(args);
                if to.is_empty() || text.is_empty() {
                    return Err(AppError::Usage("/msg <handle> <message>"));
                }
                Ok(ClientMessage::Private {
                    to: to.to_string(),
                    text: text.to_string(),
                })
            }
            "sendfile" => {
                if args.is_empty() {
                    return Err(AppError::Usage("/sendfile <file_path>"));
                }
                Ok(ClientMessage::SendFile {
                    path: args.to_string(),
                })
            }
            "history" => Ok(ClientMessage::History),
            "whoami" => Ok(ClientMessage::WhoAmI),
            _ => Err(AppError::UnknownCommand(format!("/{}", name))),
        }
    }
}

/// Split off the first whitespace-delimited word; the remainder is trimmed.
pub(crate) fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

/// A timestamped message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sent_at: DateTime<Utc>,
    /// None for server notices
    pub sender_id: Option<UserId>,
    pub sender: String,
    pub text: String,
}

impl Envelope {
    /// Chat text from a user
    pub fn chat(sender_id: UserId, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sent_at: Utc::now(),
            sender_id: Some(sender_id),
            sender: sender.into(),
            text: text.into(),
        }
    }

    /// Notice from the server itself
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            sent_at: Utc::now(),
            sender_id: None,
            sender: "SERVER".to_string(),
            text: text.into(),
        }
    }

    /// Wall-clock time of day the envelope was created
    pub fn clock(&self) -> String {
        self.sent_at
            .with_timezone(&Local)
            .format("%H:%M:%S")
            .to_string()
    }
}

/// A message as recorded by the message store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub envelope: Envelope,
}

/// Direction of a transfer, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "Upload"),
            Direction::Download => write!(f, "Download"),
        }
    }
}

/// Server → Client message
///
/// Each variant renders to one or more newline-separated text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Pre-authentication prompt
    Welcome,
    /// Login accepted
    LoggedIn { display_name: String },
    /// Registration accepted
    Registered { display_name: String },
    /// Authentication gave up after too many failures
    Rejected,
    /// Banner sent once after authentication
    Greeting { display_name: String },
    /// Command reference
    Help,
    /// Display names of everyone online
    OnlineUsers(Vec<String>),
    /// Reply to `/whoami`
    WhoAmI { display_name: String, handle: String },
    /// Recent broadcast messages, oldest first
    History(Vec<StoredMessage>),
    /// Broadcast chat line
    Chat(Envelope),
    /// Server notice (joins, leaves, announcements)
    Notice(Envelope),
    /// Private message delivered to its recipient
    PrivateReceived(Envelope),
    /// Confirmation of a private message, sent back to its author
    PrivateSent { envelope: Envelope, to: String },
    /// A download is about to start
    SendingFile { name: String, size: u64 },
    /// An upload has been announced
    ReceivingFile { name: String, size: u64 },
    /// Coarse transfer progress
    Progress { direction: Direction, percent: u8 },
    /// Download finished
    FileSent { name: String },
    /// Upload finished and stored at `path`
    FileReceived { path: PathBuf },
    /// One-line error report
    Error(String),
    /// The server is closing this connection
    Disconnecting(String),
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Welcome => {
                writeln!(f, "Welcome to FileTalk! Please login or register.")?;
                write!(
                    f,
                    "Commands: LOGIN <username> <password> or REGISTER <username> <password> <display_name>"
                )
            }
            ServerMessage::LoggedIn { display_name } => {
                write!(f, "Login successful! Welcome back, {}", display_name)
            }
            ServerMessage::Registered { display_name } => {
                write!(f, "Registration successful! Welcome, {}", display_name)
            }
            ServerMessage::Rejected => {
                write!(f, "ERROR: Too many failed attempts. Disconnecting...")
            }
            ServerMessage::Greeting { display_name } => {
                writeln!(f, "===== Welcome to FileTalk =====")?;
                writeln!(f, "Hello {}!", display_name)?;
                writeln!(f, "You can now chat with other users. File sharing is enabled.")?;
                writeln!(f, "Type /help for available commands")?;
                write!(f, "===============================")
            }
            ServerMessage::Help => {
                writeln!(f, "=== FileTalk Commands ===")?;
                writeln!(f, "/help               - Show this help message")?;
                writeln!(f, "/users              - List online users")?;
                writeln!(f, "/msg <user> <text>  - Send private message")?;
                writeln!(f, "/sendfile <path>    - Download a file from the server")?;
                writeln!(f, "/history            - Show recent messages")?;
                writeln!(f, "/whoami             - Show your info")?;
                writeln!(f, "SENDFILE <name>     - Upload a file (followed by binary payload)")?;
                writeln!(f, "exit                - Disconnect from server")?;
                write!(f, "=========================")
            }
            ServerMessage::OnlineUsers(names) => {
                write!(f, "=== Online Users ({}) ===", names.len())?;
                for name in names {
                    write!(f, "\n* {}", name)?;
                }
                Ok(())
            }
            ServerMessage::WhoAmI {
                display_name,
                handle,
            } => write!(f, "You are: {} (@{})", display_name, handle),
            ServerMessage::History(messages) => {
                if messages.is_empty() {
                    return write!(f, "No messages yet");
                }
                write!(f, "=== Recent Messages ({}) ===", messages.len())?;
                for message in messages {
                    let env = &message.envelope;
                    write!(f, "\n[{}] {}: {}", env.clock(), env.sender, env.text)?;
                }
                Ok(())
            }
            ServerMessage::Chat(env) => {
                write!(f, "[{}] {}: {}", env.clock(), env.sender, env.text)
            }
            ServerMessage::Notice(env) => write!(f, "[{}] SERVER: {}", env.clock(), env.text),
            ServerMessage::PrivateReceived(env) => {
                write!(f, "[{}] {} -> You: {}", env.clock(), env.sender, env.text)
            }
            ServerMessage::PrivateSent { envelope, to } => {
                write!(f, "[{}] You -> {}: {}", envelope.clock(), to, envelope.text)
            }
            ServerMessage::SendingFile { name, size } => {
                write!(f, "Sending file: {} ({})", name, format_size(*size))
            }
            ServerMessage::ReceivingFile { name, size } => {
                write!(f, "Receiving file: {} ({})", name, format_size(*size))
            }
            ServerMessage::Progress { direction, percent } => {
                write!(f, "{} progress: {}%", direction, percent)
            }
            ServerMessage::FileSent { name } => write!(f, "File sent successfully: {}", name),
            ServerMessage::FileReceived { path } => {
                write!(f, "File received successfully: {}", path.display())
            }
            ServerMessage::Error(message) => write!(f, "ERROR: {}", message),
            ServerMessage::Disconnecting(reason) => write!(f, "Disconnecting: {}", reason),
        }
    }
}

/// Human readable byte count, one decimal above 1 KB
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.1} GB", b / (KB * KB * KB))
    }
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let message = match &err {
            AppError::UnknownCommand(cmd) => {
                format!("Unknown command: {}. Type /help for available commands.", cmd)
            }
            AppError::Usage(usage) => format!("Usage: {}", usage),
            AppError::FileTooLarge { limit, .. } => {
                format!("File too large. Maximum size is {}.", format_size(*limit))
            }
            AppError::File { source, .. } => format!("File transfer failed: {}", source),
            AppError::Store(_) => "Storage is unavailable, please try again later".to_string(),
            // Fatal errors are not typically converted (connection closes)
            _ => err.to_string(),
        };
        ServerMessage::Error(message)
    }
}
