//! WebSocket connection plumbing shared by every role
//!
//! A [`WsConnection`] splits an established WebSocket into:
//! - a cloneable [`PeerHandle`] that queues outgoing frames for a writer task
//! - a [`WsReader`] that yields inbound text/binary frames until the peer
//!   goes away or the handle is closed
//!
//! The writer drains whatever is already queued before it closes, so
//! `send_control` followed by `close` delivers the control message first.

use std::net::SocketAddr;
use std::time::Duration;

use burrow_proto::{encode, ControlMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::error::{is_benign_ws, TransportError, TransportResult};

/// Outgoing frames buffered per connection before senders wait
const OUTBOUND_CAPACITY: usize = 64;

/// Upper bound on the closing handshake of a connection being torn down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Sending side of a connection
#[derive(Clone)]
pub struct PeerHandle {
    id: String,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PeerHandle {
    /// A handle whose frames land in the returned receiver instead of a socket
    pub fn channel(remote_addr: SocketAddr) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Self {
            id: format!("ws-{}", uuid::Uuid::new_v4()),
            remote_addr,
            tx,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Unique id of this connection, used for identity comparisons
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Same underlying connection
    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        self.id == other.id
    }

    /// Queue a binary frame, waiting while the outbound queue is full
    pub async fn send_binary(&self, data: Vec<u8>) -> TransportResult<()> {
        self.send(Message::Binary(data)).await
    }

    /// Queue a control message as a text frame
    pub async fn send_control(&self, message: &ControlMessage) -> TransportResult<()> {
        let text = encode(message)?;
        trace!(conn = %self.id, kind = %message.kind(), "Queue control message");
        self.send(Message::Text(text)).await
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }
        tokio::select! {
            result = self.tx.send(message) => result.map_err(|_| TransportError::StreamClosed),
            _ = self.cancel.cancelled() => Err(TransportError::StreamClosed),
        }
    }

    /// Close the connection once queued frames are written
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Send a final control message and close; delivery is best effort
    pub async fn send_and_close(&self, message: &ControlMessage) {
        if let Err(e) = self.send_control(message).await {
            debug!(conn = %self.id, error = %e, "Final control message not queued");
        }
        self.close();
    }

    /// Resolves once the connection is closed from either side
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Receiving side of a connection
pub struct WsReader<S> {
    source: SplitStream<WebSocketStream<S>>,
    cancel: CancellationToken,
    conn_id: String,
}

impl<S> std::fmt::Debug for WsReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReader")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next text or binary frame; `None` once the connection is finished
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = self.source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Some(Inbound::Text(text)),
                Some(Ok(Message::Binary(data))) => return Some(Inbound::Binary(data)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    trace!("[{}] Ping/pong handled by tungstenite", self.conn_id);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("[{}] WebSocket close received", self.conn_id);
                    break;
                }
                Some(Err(e)) => {
                    if is_benign_ws(&e) {
                        debug!("[{}] WebSocket read ended: {}", self.conn_id, e);
                    } else {
                        warn!("[{}] WebSocket read error: {}", self.conn_id, e);
                    }
                    break;
                }
                None => break,
            }
        }

        self.cancel.cancel();
        None
    }
}

/// An established WebSocket split into its handle and reader
pub struct WsConnection<S> {
    pub handle: PeerHandle,
    pub reader: WsReader<S>,
}

impl<S> std::fmt::Debug for WsConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the writer task and hand back both halves
    pub fn new(ws_stream: WebSocketStream<S>, remote_addr: SocketAddr) -> Self {
        let (sink, source) = ws_stream.split();
        let (handle, rx) = PeerHandle::channel(remote_addr);

        let cancel = handle.cancel.clone();
        let conn_id = handle.id.clone();
        tokio::spawn(async move {
            writer_task(sink, rx, cancel, conn_id).await;
        });

        let reader = WsReader {
            source,
            cancel: handle.cancel.clone(),
            conn_id: handle.id.clone(),
        };

        Self { handle, reader }
    }
}

/// Writer task - batches queued frames into one flush
async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    conn_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = cancel.cancelled() => None,
        };
        let Some(first) = first else {
            break;
        };

        if let Err(e) = write_batch(&mut sink, &mut rx, first).await {
            if is_benign_ws(&e) {
                debug!("[{}] WebSocket write ended: {}", conn_id, e);
            } else {
                warn!("[{}] WebSocket send error: {}", conn_id, e);
            }
            cancel.cancel();
            return;
        }
    }

    // Flush what was queued before close() and then say goodbye
    let drained = async {
        while let Ok(message) = rx.try_recv() {
            sink.feed(message).await?;
        }
        sink.flush().await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, drained).await {
        Ok(Err(e)) if !is_benign_ws(&e) => debug!("[{}] Close failed: {}", conn_id, e),
        Err(_) => debug!("[{}] Close timed out", conn_id),
        _ => {}
    }

    cancel.cancel();
    debug!("[{}] WebSocket writer task ended", conn_id);
}

async fn write_batch<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    rx: &mut mpsc::Receiver<Message>,
    first: Message,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    sink.feed(first).await?;
    while let Ok(message) = rx.try_recv() {
        sink.feed(message).await?;
    }
    sink.flush().await
}
