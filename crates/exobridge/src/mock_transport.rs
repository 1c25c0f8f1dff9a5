//! In-memory transports for testing.
//!
//! Used by the crate's own tests and by integration tests standing in for a
//! remote runtime. Not meant for production use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via send() appear on the peer's recv() and vice versa.
/// Dropping one end makes the other end's recv() report a closed stream.
pub struct DuplexChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_b)),
        };

        let b = Self {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_a)),
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// A scripted stand-in for the remote runtime.
///
/// Tests read the requests the bridge sends and answer them by hand, in any
/// order they like.
pub struct FakeRemote {
    transport: DuplexChannelTransport,
}

impl FakeRemote {
    /// Returns the transport to hand to the bridge and the remote end driving it.
    pub fn pair() -> (DuplexChannelTransport, Self) {
        let (local, remote) = DuplexChannelTransport::pair();
        (local, Self { transport: remote })
    }

    /// Next frame the bridge sent, or `None` if nothing valid arrived in time.
    pub async fn recv_within(&self, within: Duration) -> Option<Value> {
        let frame = tokio::time::timeout(within, self.transport.recv()).await.ok()?;
        let bytes = frame.ok()??;
        serde_json::from_slice(&bytes).ok()
    }

    /// Next frame the bridge sent, waiting up to five seconds.
    pub async fn recv(&self) -> Option<Value> {
        self.recv_within(Duration::from_secs(5)).await
    }

    pub async fn send(&self, frame: Value) -> transport::Result<()> {
        self.transport.send(frame.to_string().as_bytes()).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> transport::Result<()> {
        self.transport.send(bytes).await
    }

    /// Answers request `r` with `val` tagged `kind`.
    pub async fn reply(&self, r: u64, kind: &str, val: Value) -> transport::Result<()> {
        self.send(serde_json::json!({ "r": r, "key": kind, "val": val })).await
    }

    /// Answers request `r` with an error payload.
    pub async fn reply_error(&self, r: u64, message: &str, name: &str) -> transport::Result<()> {
        self.send(serde_json::json!({ "r": r, "error": { "message": message, "name": name } }))
            .await
    }

    /// Answers the FFID-assignment half of call `r`.
    pub async fn assign(&self, r: u64, assignments: &[(u64, u64)]) -> transport::Result<()> {
        let val: serde_json::Map<String, Value> = assignments
            .iter()
            .map(|(tag, ffid)| (tag.to_string(), Value::from(*ffid)))
            .collect();
        self.send(serde_json::json!({ "r": r + 1, "val": val })).await
    }
}
