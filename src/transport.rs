//! Transport session
//!
//! One connection is split once into a read half and a write half.
//!
//! - [`LineReader`] owns the read half behind a single `BufReader`, so text
//!   lines and raw payload bytes are consumed from the same cursor. Nothing
//!   buffered by a line read is lost when the next read is a binary one.
//! - [`LineWriter`] owns the write half. It is driven by [`write_loop`],
//!   which drains the session's outbound queue in FIFO order. File downloads
//!   are queue items too, so a payload is never interleaved with other lines.

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::message::ServerMessage;
use crate::transfer::{self, OutgoingFile, TransferLimits};

/// One item in a session's outbound queue
#[derive(Debug)]
pub enum Outbound {
    /// Text line(s)
    Message(ServerMessage),
    /// Control line, length and payload of a download
    File(OutgoingFile),
}

/// Line and raw-byte reader over one buffered cursor
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_line,
        }
    }

    /// Read one line without its terminator.
    ///
    /// Returns `None` at end-of-stream. A trailing `\r` is stripped and
    /// invalid UTF-8 is replaced rather than rejected. A final line without
    /// a newline is still returned.
    pub async fn read_line(&mut self) -> Result<Option<String>, AppError> {
        let mut buf = Vec::new();
        // Room for a full line plus its `\r\n`
        let limit = self.max_line as u64 + 2;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if buf.len() > self.max_line {
            return Err(AppError::LineTooLong(self.max_line));
        }

        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read exactly `n` bytes; end-of-stream first is an error
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, AppError> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a big-endian u64 length prefix
    pub async fn read_u64(&mut self) -> Result<u64, AppError> {
        Ok(self.inner.read_u64().await?)
    }

    /// Read at most `buf.len()` bytes, at least one.
    ///
    /// End-of-stream is an `UnexpectedEof` error: callers only ask for
    /// bytes they were promised.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, AppError> {
        let n = self.inner.read(buf).await?;
        if n == 0 && !buf.is_empty() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(n)
    }

    /// Consume and drop exactly `n` bytes
    pub async fn discard(&mut self, n: u64) -> Result<(), AppError> {
        let mut payload = (&mut self.inner).take(n);
        let copied = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        if copied < n {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

/// Line and raw-byte writer
pub struct LineWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Write `text` followed by a newline
    pub async fn write_line(&mut self, text: &str) -> Result<(), AppError> {
        self.inner.write_all(text.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), AppError> {
        self.inner.write_all(buf).await?;
        Ok(())
    }

    /// Write a big-endian u64 length prefix
    pub async fn write_u64(&mut self, value: u64) -> Result<(), AppError> {
        self.inner.write_u64(value).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AppError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Drain a session's outbound queue onto the wire.
///
/// Returns when every sender is dropped (queue fully flushed) or on the
/// first write failure. A download whose payload fails part-way is fatal:
/// the peer is still counting bytes and cannot resynchronize.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: LineWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
    limits: TransferLimits,
) -> Result<(), AppError> {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(msg) => writer.write_line(&msg.to_string()).await?,
            Outbound::File(file) => match transfer::send_file(&mut writer, &file, &limits).await {
                Ok(descriptor) => {
                    debug!("Sent {} ({} bytes)", descriptor.name, descriptor.transferred);
                    let done = ServerMessage::FileSent {
                        name: descriptor.name,
                    };
                    writer.write_line(&done.to_string()).await?;
                }
                Err(e) if !e.is_fatal() => {
                    warn!("Download of {} not started: {}", file.path.display(), e);
                    writer.write_line(&ServerMessage::from(e).to_string()).await?;
                }
                Err(e) => return Err(e),
            },
        }

        if rx.is_empty() {
            writer.flush().await?;
        }
    }

    writer.flush().await?;
    writer.shutdown().await
}
