//! In-band file transfer
//!
//! Wire format, both directions: a `SENDFILE <name>` control line, an
//! 8-byte big-endian length, then exactly that many raw bytes. There is no
//! checksum; the byte count is the only integrity check.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::message::{Direction, ServerMessage, CONTROL_TOKEN};
use crate::transport::{LineReader, LineWriter};

/// Percentages at which progress is reported
const PROGRESS_STEPS: [u8; 4] = [25, 50, 75, 100];

/// Size and chunking limits for transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// Largest accepted payload
    pub max_size: u64,
    /// Bytes moved per read/write
    pub chunk_size: usize,
    /// Payloads above this size get progress notifications
    pub progress_threshold: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            chunk_size: 8 * 1024,
            progress_threshold: 1024 * 1024,
        }
    }
}

impl From<&Config> for TransferLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_size: config.max_file_size,
            chunk_size: config.chunk_size.max(1),
            progress_threshold: config.progress_threshold,
        }
    }
}

/// State of one transfer in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub name: String,
    /// Declared payload length
    pub size: u64,
    pub transferred: u64,
}

impl TransferDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            transferred: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.transferred
    }
}

/// Reports each 25% step at most once
#[derive(Debug)]
pub struct ProgressTracker {
    size: u64,
    enabled: bool,
    next_step: usize,
}

impl ProgressTracker {
    pub fn new(size: u64, threshold: u64) -> Self {
        Self {
            size,
            enabled: size > threshold,
            next_step: 0,
        }
    }

    /// Highest step newly crossed by `transferred`, if any
    pub fn advance(&mut self, transferred: u64) -> Option<u8> {
        if !self.enabled || self.size == 0 {
            return None;
        }
        let percent = (transferred.saturating_mul(100) / self.size).min(100);
        let mut crossed = None;
        while self.next_step < PROGRESS_STEPS.len()
            && percent >= u64::from(PROGRESS_STEPS[self.next_step])
        {
            crossed = Some(PROGRESS_STEPS[self.next_step]);
            self.next_step += 1;
        }
        crossed
    }
}

/// A validated download, queued on the requesting session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// Name announced on the control line
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// An upload written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub descriptor: TransferDescriptor,
}

/// Reduce an announced name to a safe final path component
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.trim().rsplit(['/', '\\']).next().unwrap_or("");
    match base {
        "" | "." | ".." => "unnamed".to_string(),
        other => other.to_string(),
    }
}

/// Resolve a `/sendfile` request against the file directory.
///
/// Absolute paths and parent components are refused. The file must exist,
/// be a regular file, and fit under the size ceiling.
pub async fn resolve_download(
    root: &Path,
    requested: &str,
    limits: &TransferLimits,
) -> Result<OutgoingFile, AppError> {
    let relative = Path::new(requested);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(AppError::InvalidPath(requested.to_string()));
    }

    let path = root.join(relative);
    let metadata = match fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::FileNotFound(requested.to_string()))
        }
        Err(e) => return Err(AppError::file(&path, e)),
    };
    if !metadata.is_file() {
        return Err(AppError::InvalidPath(requested.to_string()));
    }
    if metadata.len() > limits.max_size {
        return Err(AppError::FileTooLarge {
            size: metadata.len(),
            limit: limits.max_size,
        });
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    Ok(OutgoingFile {
        name,
        path,
        size: metadata.len(),
    })
}

/// Stream a download: control line, length, payload.
///
/// Failing to open the file is reported before anything is written and is
/// not fatal. Any failure after the header is fatal for the connection.
pub async fn send_file<W: AsyncWrite + Unpin>(
    writer: &mut LineWriter<W>,
    file: &OutgoingFile,
    limits: &TransferLimits,
) -> Result<TransferDescriptor, AppError> {
    let mut source = File::open(&file.path)
        .await
        .map_err(|e| AppError::file(&file.path, e))?;

    writer
        .write_line(&format!("{} {}", CONTROL_TOKEN, file.name))
        .await?;
    writer.write_u64(file.size).await?;

    let mut descriptor = TransferDescriptor::new(file.name.clone(), file.size);
    let mut progress = ProgressTracker::new(file.size, limits.progress_threshold);
    let mut buf = vec![0u8; limits.chunk_size];

    while descriptor.remaining() > 0 {
        let want = descriptor.remaining().min(buf.len() as u64) as usize;
        let n = source
            .read(&mut buf[..want])
            .await
            .map_err(|e| payload_failure(&file.path, e))?;
        if n == 0 {
            let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during transfer");
            return Err(payload_failure(&file.path, eof));
        }

        writer.write_bytes(&buf[..n]).await?;
        descriptor.transferred += n as u64;

        if let Some(percent) = progress.advance(descriptor.transferred) {
            info!("{} progress for {}: {}%", Direction::Download, file.name, percent);
        }
    }

    Ok(descriptor)
}

/// A local read error after the header went out; the stream is now desynced
fn payload_failure(path: &Path, e: io::Error) -> AppError {
    AppError::Io(io::Error::new(
        e.kind(),
        format!("reading {}: {}", path.display(), e),
    ))
}

/// Receive an upload announced by `SENDFILE <name>` into `dest_dir`.
///
/// The declared payload is always consumed in full so the stream cursor
/// ends exactly on the next line, even when the transfer is refused or the
/// disk write fails. Only stream failures are fatal; the partial file is
/// removed on any failure.
pub async fn receive_file<R, F>(
    reader: &mut LineReader<R>,
    name: &str,
    dest_dir: &Path,
    limits: &TransferLimits,
    mut notify: F,
) -> Result<ReceivedFile, AppError>
where
    R: AsyncRead + Unpin,
    F: FnMut(ServerMessage),
{
    let size = reader.read_u64().await?;
    let name = sanitize_file_name(name);

    if size > limits.max_size {
        reader.discard(size).await?;
        return Err(AppError::FileTooLarge {
            size,
            limit: limits.max_size,
        });
    }

    notify(ServerMessage::ReceivingFile {
        name: name.clone(),
        size,
    });

    let path = dest_dir.join(&name);
    // Bound before `file` so the handle is closed before the removal runs
    let partial;
    let mut file = match create_destination(dest_dir, &path).await {
        Ok(file) => file,
        Err(e) => {
            reader.discard(size).await?;
            return Err(AppError::file(&path, e));
        }
    };
    partial = PartialUpload::new(&path);

    let mut descriptor = TransferDescriptor::new(name, size);
    let mut progress = ProgressTracker::new(size, limits.progress_threshold);
    let mut buf = vec![0u8; limits.chunk_size];
    let mut disk_error = None;

    while descriptor.remaining() > 0 {
        let want = descriptor.remaining().min(buf.len() as u64) as usize;
        let n = reader.read_chunk(&mut buf[..want]).await?;

        if disk_error.is_none() {
            if let Err(e) = file.write_all(&buf[..n]).await {
                disk_error = Some(e);
            }
        }
        descriptor.transferred += n as u64;

        if let Some(percent) = progress.advance(descriptor.transferred) {
            notify(ServerMessage::Progress {
                direction: Direction::Upload,
                percent,
            });
        }
    }

    if disk_error.is_none() {
        disk_error = file.flush().await.err();
    }
    drop(file);

    if let Some(e) = disk_error {
        return Err(AppError::file(&path, e));
    }
    partial.keep();

    notify(ServerMessage::FileReceived { path: path.clone() });
    Ok(ReceivedFile { path, descriptor })
}

async fn create_destination(dir: &Path, path: &Path) -> io::Result<File> {
    fs::create_dir_all(dir).await?;
    File::create(path).await
}

/// Deletes an upload's destination when dropped unless `keep` was called.
///
/// Covers early returns as well as the receiving future being dropped
/// mid-payload by a kick or shutdown.
struct PartialUpload {
    path: PathBuf,
    armed: bool,
}

impl PartialUpload {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial upload {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial upload {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn small_limits() -> TransferLimits {
        TransferLimits {
            max_size: 1024,
            chunk_size: 16,
            progress_threshold: 32,
        }
    }

    #[test]
    fn test_progress_steps_reported_once() {
        let mut progress = ProgressTracker::new(100, 10);
        assert_eq!(progress.advance(10), None);
        assert_eq!(progress.advance(25), Some(25));
        assert_eq!(progress.advance(30), None);
        assert_eq!(progress.advance(80), Some(75));
        assert_eq!(progress.advance(100), Some(100));
        assert_eq!(progress.advance(100), None);
    }

    #[test]
    fn test_progress_disabled_for_small_payloads() {
        let mut progress = ProgressTracker::new(100, 1024);
        assert_eq!(progress.advance(100), None);
        let mut empty = ProgressTracker::new(0, 0);
        assert_eq!(empty.advance(0), None);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\temp\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("dir/.."), "unnamed");
    }

    #[tokio::test]
    async fn test_resolve_download_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let limits = small_limits();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert!(matches!(
            resolve_download(dir.path(), "../secret", &limits).await,
            Err(AppError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_download(dir.path(), "/etc/passwd", &limits).await,
            Err(AppError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_download(dir.path(), "missing.txt", &limits).await,
            Err(AppError::FileNotFound(_))
        ));
        assert!(matches!(
            resolve_download(dir.path(), "sub", &limits).await,
            Err(AppError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_download(dir.path(), "big.bin", &limits).await,
            Err(AppError::FileTooLarge { size: 2048, limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_send_file_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..100u8).collect();
        std::fs::write(dir.path().join("data.bin"), &content).unwrap();
        let limits = small_limits();

        let file = resolve_download(dir.path(), "data.bin", &limits)
            .await
            .unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = LineWriter::new(server);
        let descriptor = send_file(&mut writer, &file, &limits).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(descriptor.transferred, 100);

        let mut reader = LineReader::new(client, 1024);
        assert_eq!(
            reader.read_line().await.unwrap().unwrap(),
            "SENDFILE data.bin"
        );
        assert_eq!(reader.read_u64().await.unwrap(), 100);
        assert_eq!(reader.read_exact(100).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_receive_file_stops_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let limits = small_limits();
        let payload: Vec<u8> = (0..200).map(|i| (i % 251) as u8).collect();

        let (mut client, server) = tokio::io::duplex(4096);
        let mut wire = (payload.len() as u64).to_be_bytes().to_vec();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(b"/whoami\n");
        client.write_all(&wire).await.unwrap();

        let mut reader = LineReader::new(server, 1024);
        let mut notices = Vec::new();
        let received = receive_file(&mut reader, "photo.jpg", dir.path(), &limits, |m| {
            notices.push(m)
        })
        .await
        .unwrap();

        assert_eq!(received.path, dir.path().join("photo.jpg"));
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "/whoami");

        let progress: Vec<u8> = notices
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);
        let completions = notices
            .iter()
            .filter(|m| matches!(m, ServerMessage::FileReceived { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_receive_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&0u64.to_be_bytes()).await.unwrap();

        let mut reader = LineReader::new(server, 64);
        let mut notices = Vec::new();
        let received = receive_file(&mut reader, "empty.txt", dir.path(), &small_limits(), |m| {
            notices.push(m)
        })
        .await
        .unwrap();

        assert_eq!(std::fs::metadata(&received.path).unwrap().len(), 0);
        assert!(matches!(
            notices.last(),
            Some(ServerMessage::FileReceived { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_upload_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let limits = small_limits();
        let (mut client, server) = tokio::io::duplex(8192);
        let mut wire = 2000u64.to_be_bytes().to_vec();
        wire.extend_from_slice(&[7u8; 2000]);
        wire.extend_from_slice(b"hello\n");
        client.write_all(&wire).await.unwrap();

        let mut reader = LineReader::new(server, 64);
        let result = receive_file(&mut reader, "big.bin", dir.path(), &limits, |_| {}).await;

        assert!(matches!(result, Err(AppError::FileTooLarge { .. })));
        assert!(!dir.path().join("big.bin").exists());
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_truncated_upload_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(256);
        let mut wire = 100u64.to_be_bytes().to_vec();
        wire.extend_from_slice(&[1u8; 40]);
        client.write_all(&wire).await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server, 64);
        let result =
            receive_file(&mut reader, "cut.bin", dir.path(), &small_limits(), |_| {}).await;

        assert!(result.unwrap_err().is_fatal());
        assert!(!dir.path().join("cut.bin").exists());
    }

    #[tokio::test]
    async fn test_cancelled_upload_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(256);
        let mut wire = 1000u64.to_be_bytes().to_vec();
        wire.extend_from_slice(&[1u8; 100]);
        client.write_all(&wire).await.unwrap();

        // The sender stays connected, so the receive is still waiting for
        // payload when the future is dropped
        let mut reader = LineReader::new(server, 64);
        let limits = small_limits();
        let pending = receive_file(&mut reader, "part.bin", dir.path(), &limits, |_| {});
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(100), pending).await;

        assert!(outcome.is_err());
        assert!(!dir.path().join("part.bin").exists());
        drop(client);
    }
}
