//! Integration tests for full client sessions
//!
//! Each test drives the server through the wire protocol, either over an
//! in-memory duplex stream or a real TCP socket.

use std::path::Path;
use std::time::Duration;

use filetalk::{handle_connection, ChatServer, Config, Storage};
use tempfile::TempDir;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};

const STEP: Duration = Duration::from_secs(5);

struct TestClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> TestClient<S> {
    fn new(stream: S) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Next line, None at end of stream
    async fn line(&mut self) -> Option<String> {
        let mut buf = String::new();
        let n = tokio::time::timeout(STEP, self.reader.read_line(&mut buf))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        (n > 0).then(|| buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Skip lines until one contains `needle`
    async fn expect(&mut self, needle: &str) -> String {
        loop {
            match self.line().await {
                Some(line) if line.contains(needle) => return line,
                Some(_) => continue,
                None => panic!("stream ended before {:?}", needle),
            }
        }
    }

    async fn expect_eof(&mut self) {
        while self.line().await.is_some() {}
    }

    async fn read_u64(&mut self) -> u64 {
        tokio::time::timeout(STEP, self.reader.read_u64())
            .await
            .unwrap()
            .unwrap()
    }

    async fn read_payload(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(STEP, self.reader.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }
}

type DuplexClient = TestClient<tokio::io::DuplexStream>;

fn server_with(files_dir: &Path, tweak: impl FnOnce(&mut Config)) -> ChatServer {
    let mut config = Config {
        files_dir: files_dir.to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    ChatServer::new(config, Storage::in_memory())
}

fn connect(server: &ChatServer) -> DuplexClient {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let server = server.clone();
    let shutdown = server.subscribe_shutdown();
    tokio::spawn(async move {
        let _ = handle_connection(remote, "duplex".to_string(), server, shutdown).await;
    });
    TestClient::new(local)
}

async fn register(server: &ChatServer, handle: &str, display: &str) -> DuplexClient {
    let mut client = connect(server);
    client.expect("Please login or register").await;
    client
        .send(&format!("REGISTER {} secret {}", handle, display))
        .await;
    client.expect("Registration successful").await;
    client.expect("=== Online Users").await;
    client
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(STEP, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_chat_private_and_exit() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});

    let mut alice = register(&server, "alice", "Alice").await;
    let mut bob = register(&server, "bob", "Bob Builder").await;
    alice.expect("SERVER: Bob Builder joined the chat").await;

    bob.send("hello everyone").await;
    alice.expect("Bob Builder: hello everyone").await;
    bob.expect("Bob Builder: hello everyone").await;

    alice.send("/msg bob psst").await;
    bob.expect("Alice -> You: psst").await;
    alice.expect("You -> bob: psst").await;

    bob.send("/users").await;
    bob.expect("=== Online Users (2) ===").await;

    bob.send("/nope").await;
    bob.expect("ERROR: Unknown command: /nope").await;

    bob.send("exit").await;
    bob.expect("Disconnecting: Goodbye!").await;
    bob.expect_eof().await;

    alice.expect("Bob Builder left the chat").await;
    wait_until(|| server.registry().list_online() == vec!["Alice".to_string()]).await;
}

#[tokio::test]
async fn test_three_bad_credentials_reject() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});

    let mut client = connect(&server);
    client.expect("Please login or register").await;
    client.send("LOGIN ghost wrong").await;
    client.expect("ERROR: Invalid username or password").await;
    client.send("HELLO").await;
    client.expect("ERROR:").await;
    client.send("LOGIN").await;
    client.expect("Too many failed attempts").await;
    client.expect_eof().await;

    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn test_login_after_register_and_duplicate_session() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});

    let first = register(&server, "carol", "Carol").await;
    drop(first);
    wait_until(|| server.registry().is_empty()).await;

    let mut again = connect(&server);
    again.expect("Please login or register").await;
    again.send("LOGIN carol secret").await;
    again.expect("Login successful! Welcome back, Carol").await;

    let mut twin = connect(&server);
    twin.expect("Please login or register").await;
    twin.send("LOGIN carol secret").await;
    twin.expect("already logged in").await;
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn test_upload_then_whoami() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let mut wire = b"SENDFILE ../../notes.bin\n".to_vec();
    wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    wire.extend_from_slice(&payload);
    wire.extend_from_slice(b"/whoami\n");
    alice.send_bytes(&wire).await;

    alice.expect("Receiving file: notes.bin").await;
    alice.expect("File received successfully").await;
    alice.expect("You are: Alice (@alice)").await;

    let stored = std::fs::read(dir.path().join("alice").join("notes.bin")).unwrap();
    assert_eq!(stored, payload);
}

#[tokio::test]
async fn test_empty_upload() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;

    let mut wire = b"SENDFILE empty.txt\n".to_vec();
    wire.extend_from_slice(&0u64.to_be_bytes());
    alice.send_bytes(&wire).await;
    alice.expect("File received successfully").await;

    let meta = std::fs::metadata(dir.path().join("alice").join("empty.txt")).unwrap();
    assert_eq!(meta.len(), 0);
}

#[tokio::test]
async fn test_oversized_upload_keeps_stream_aligned() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |c| c.max_file_size = 10);
    let mut alice = register(&server, "alice", "Alice").await;

    let mut wire = b"SENDFILE big.bin\n".to_vec();
    wire.extend_from_slice(&64u64.to_be_bytes());
    wire.extend_from_slice(&[7u8; 64]);
    wire.extend_from_slice(b"/whoami\n");
    alice.send_bytes(&wire).await;

    alice.expect("ERROR: File too large").await;
    alice.expect("You are: Alice (@alice)").await;
    assert!(!dir.path().join("alice").join("big.bin").exists());
}

#[tokio::test]
async fn test_download_and_sharing_notice() {
    let dir = TempDir::new().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
    std::fs::write(dir.path().join("share.bin"), &content).unwrap();

    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;
    let mut bob = register(&server, "bob", "Bob").await;

    alice.send("/sendfile share.bin").await;
    alice.expect("Sending file: share.bin").await;
    assert_eq!(alice.expect("SENDFILE").await, "SENDFILE share.bin");
    let size = alice.read_u64().await;
    assert_eq!(size, content.len() as u64);
    assert_eq!(alice.read_payload(size as usize).await, content);
    assert_eq!(
        alice.line().await.as_deref(),
        Some("File sent successfully: share.bin")
    );

    bob.expect("Alice is sharing file: share.bin").await;

    alice.send("/sendfile ../secret").await;
    alice.expect("ERROR: Invalid file path").await;
    alice.send("/sendfile missing.bin").await;
    alice.expect("ERROR: File not found").await;
}

#[tokio::test]
async fn test_history_lists_recent_broadcasts() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |c| c.history_limit = 2);
    let mut alice = register(&server, "alice", "Alice").await;

    for text in ["first", "second", "third"] {
        alice.send(text).await;
        alice.expect(text).await;
    }
    alice.send("/history").await;
    alice.expect("=== Recent Messages (2) ===").await;
    assert!(alice.line().await.unwrap().ends_with("Alice: second"));
    assert!(alice.line().await.unwrap().ends_with("Alice: third"));
}

#[tokio::test]
async fn test_abrupt_disconnect_removes_only_that_user() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;
    let bob = register(&server, "bob", "Bob").await;
    assert_eq!(server.registry().len(), 2);

    drop(bob);

    wait_until(|| server.registry().list_online() == vec!["Alice".to_string()]).await;
    alice.expect("Bob left the chat").await;
}

#[tokio::test]
async fn test_kick_by_handle() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;
    let mut bob = register(&server, "bob", "Bob").await;

    assert!(server.kick("bob", "You have been kicked by the server administrator"));
    bob.expect("Disconnecting: You have been kicked").await;
    bob.expect_eof().await;

    alice.expect("Bob left the chat").await;
    assert_eq!(server.status().users, vec!["Alice"]);
}

#[tokio::test]
async fn test_kick_mid_upload_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |_| {});
    let mut alice = register(&server, "alice", "Alice").await;

    let mut wire = b"SENDFILE part.bin\n".to_vec();
    wire.extend_from_slice(&1000u64.to_be_bytes());
    wire.extend_from_slice(&[9u8; 100]);
    alice.send_bytes(&wire).await;
    alice.expect("Receiving file: part.bin").await;

    let partial = dir.path().join("alice").join("part.bin");
    wait_until(|| std::fs::metadata(&partial).map(|m| m.len() == 100).unwrap_or(false)).await;

    assert!(server.kick("alice", "You have been kicked by the server administrator"));
    alice.expect("Disconnecting: You have been kicked").await;
    alice.expect_eof().await;

    wait_until(|| server.registry().is_empty()).await;
    wait_until(|| !partial.exists()).await;
}

#[tokio::test]
async fn test_tcp_session_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let server = server_with(dir.path(), |c| c.shutdown_grace_secs = 2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    let run = tokio::spawn(async move { running.run(listener).await });

    let mut client = TestClient::new(TcpStream::connect(addr).await.unwrap());
    client.expect("Please login or register").await;
    client.send("REGISTER dave pw Dave").await;
    client.expect("Registration successful").await;
    wait_until(|| server.registry().len() == 1).await;

    server.shutdown();
    client.expect("Disconnecting: Server is shutting down").await;
    client.expect_eof().await;

    tokio::time::timeout(STEP, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(server.registry().is_empty());
}
