//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between runtimes.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: The Transport knows nothing about FFIDs, kinds or
//!   correlation ids. It moves opaque frames, one JSON record each.
//! - **Duplex**: Sending and receiving are independent. Correlating replies
//!   with requests happens above this layer, in the event loop.

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::sync::Mutex;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The peer is unreachable or the channel was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                Self::ConnectionLost(e.to_string())
            }
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex frame channel to the remote runtime.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// # invariants
    /// - Frames from concurrent senders must not interleave.
    /// - Should not interpret the payload content.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame. `Ok(None)` means the stream closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// Newline-delimited frames over any async byte stream, e.g. a child's stdio.
pub struct LineTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
        }
    }
}

impl LineTransport<ChildStdout, ChildStdin> {
    /// Takes over the piped stdio of a spawned remote runtime.
    ///
    /// Returns `None` unless both stdin and stdout were configured as pipes.
    pub fn from_child(child: &mut Child) -> Option<Self> {
        let stdout = child.stdout.take()?;
        let stdin = child.stdin.take()?;
        Some(Self::new(stdout, stdin))
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(None);
            }
            // blank lines are keep-alives
            if !line.trim_ascii().is_empty() {
                return Ok(Some(line));
            }
        }
    }
}
