//! Frame connection: the single bidirectional message channel to a device.
//!
//! Every byte that reaches the wire goes through `Connection` - writes are
//! serialized by one lock, reads carry an idle deadline, and close is
//! idempotent. The transport itself is abstracted so tests can drive a
//! session over in-memory channels.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// A frame on the wire: JSON control text or opaque audio bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Pluggable message transport under the connection.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;
    /// Receive the next frame. `None` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Frame>>;
    async fn close(&self) -> Result<()>;
}

/// The production transport over an upgraded axum WebSocket.
pub struct WsTransport {
    writer: Mutex<SplitSink<WebSocket, Message>>,
    reader: Mutex<SplitStream<WebSocket>>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }
}

#[async_trait]
impl MessageTransport for WsTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        let mut writer = self.writer.lock().await;
        writer.send(msg).await.map_err(|e| anyhow!("websocket send failed: {e}"))
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data.to_vec()))),
                // axum answers pings itself; both are only liveness traffic
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(anyhow!("websocket read failed: {e}")),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Close(None))
            .await
            .map_err(|e| anyhow!("websocket close failed: {e}"))
    }
}

/// Idle read deadline; a device that sends nothing for this long is gone.
const READ_DEADLINE: Duration = Duration::from_secs(300);
/// Per-frame write deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(30);

/// Single bidirectional message channel with deadlines and atomic close.
pub struct Connection {
    transport: Box<dyn MessageTransport>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    last_active: StdMutex<Instant>,
}

impl Connection {
    pub fn new(transport: Box<dyn MessageTransport>) -> Self {
        Self {
            transport,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    pub fn from_socket(socket: WebSocket) -> Self {
        Self::new(Box::new(WsTransport::new(socket)))
    }

    fn touch(&self) {
        *self.last_active.lock().expect("last_active lock poisoned") = Instant::now();
    }

    /// Block until the next frame, the read deadline, or an I/O error.
    /// `None` means the peer closed; deadline and I/O errors mark the
    /// connection closed before surfacing.
    pub async fn read_frame(&self) -> Result<Option<Frame>> {
        if self.is_closed() {
            return Ok(None);
        }
        match timeout(READ_DEADLINE, self.transport.recv()).await {
            Ok(Ok(Some(frame))) => {
                self.touch();
                Ok(Some(frame))
            }
            Ok(Ok(None)) => {
                self.closed.store(true, Ordering::Release);
                Ok(None)
            }
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(e)
            }
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                Err(anyhow!("read deadline exceeded"))
            }
        }
    }

    pub async fn write_text(&self, text: String) -> Result<()> {
        self.write_frame(Frame::Text(text)).await
    }

    pub async fn write_binary(&self, data: Vec<u8>) -> Result<()> {
        self.write_frame(Frame::Binary(data)).await
    }

    /// All outbound traffic funnels through here; the lock keeps frame
    /// ordering and the deadline bounds a stuck peer.
    async fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("connection closed"));
        }
        let _guard = self.write_lock.lock().await;
        match timeout(WRITE_DEADLINE, self.transport.send(frame)).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(e)
            }
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                Err(anyhow!("write deadline exceeded"))
            }
        }
    }

    /// Idempotent close: first caller sends a best-effort close frame.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.write_lock.lock().await;
        let _ = timeout(Duration::from_secs(5), self.transport.close()).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().expect("last_active lock poisoned")
    }

    pub fn is_stale(&self, idle: Duration) -> bool {
        self.last_active().elapsed() > idle
    }
}

/// In-memory transport used by the test suites to exercise sessions
/// without a socket.
pub mod testing {
    use super::*;
    use tokio::sync::mpsc;

    pub struct ChannelTransport {
        pub to_client: mpsc::UnboundedSender<Frame>,
        pub from_client: Mutex<mpsc::UnboundedReceiver<Frame>>,
    }

    impl ChannelTransport {
        /// Returns (transport, inbound sender, outbound receiver).
        pub fn new() -> (
            Self,
            mpsc::UnboundedSender<Frame>,
            mpsc::UnboundedReceiver<Frame>,
        ) {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            (
                Self {
                    to_client: out_tx,
                    from_client: Mutex::new(in_rx),
                },
                in_tx,
                out_rx,
            )
        }
    }

    #[async_trait]
    impl MessageTransport for ChannelTransport {
        async fn send(&self, frame: Frame) -> Result<()> {
            self.to_client
                .send(frame)
                .map_err(|_| anyhow!("client receiver dropped"))
        }

        async fn recv(&self) -> Result<Option<Frame>> {
            Ok(self.from_client.lock().await.recv().await)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ChannelTransport;
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let (transport, in_tx, mut out_rx) = ChannelTransport::new();
        let conn = Connection::new(Box::new(transport));

        conn.write_text("{\"type\":\"stt\"}".to_string()).await.unwrap();
        assert_eq!(
            out_rx.recv().await,
            Some(Frame::Text("{\"type\":\"stt\"}".to_string()))
        );

        in_tx.send(Frame::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(
            conn.read_frame().await.unwrap(),
            Some(Frame::Binary(vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (transport, _in_tx, _out_rx) = ChannelTransport::new();
        let conn = Connection::new(Box::new(transport));

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(conn.write_text("late".to_string()).await.is_err());
        assert!(conn.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_close_marks_closed() {
        let (transport, in_tx, _out_rx) = ChannelTransport::new();
        let conn = Connection::new(Box::new(transport));
        drop(in_tx);
        assert!(conn.read_frame().await.unwrap().is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_staleness() {
        let (transport, _in_tx, _out_rx) = ChannelTransport::new();
        let conn = Connection::new(Box::new(transport));
        assert!(!conn.is_stale(Duration::from_secs(60)));
    }
}
