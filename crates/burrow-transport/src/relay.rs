//! Byte relay between a local TCP socket and a tunnel WebSocket
//!
//! Used by the agent (target socket <-> data connection) and the client
//! (accepted socket <-> tunnel connection). Each direction is a pump; the
//! first pump to finish tears down both sides through a [`TeardownGuard`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use burrow_proto::{decode, MessageKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Inbound, PeerHandle, WsReader};
use crate::error::is_benign_io;

/// Read buffer for the local socket, well under the 1MB frame limit
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One-shot teardown shared by everything touching a tunnel
#[derive(Debug, Default)]
pub struct TeardownGuard {
    closed: AtomicBool,
    reason: OnceLock<String>,
    cancel: CancellationToken,
}

impl TeardownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the tunnel closed; only the first caller gets `true`
    pub fn close_both(&self, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.reason.set(reason.to_string());
        debug!(reason = %reason, "Tunnel teardown");
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason given by the call that closed the tunnel
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_tunnel: u64,
    pub bytes_from_tunnel: u64,
}

/// Relay until either side closes, then close both
///
/// Binary frames from the tunnel are written to the socket, socket reads
/// become binary frames. An `*_ERR` control message on the tunnel tears the
/// relay down; any other text frame is ignored.
pub async fn relay<S>(
    socket: TcpStream,
    peer: &PeerHandle,
    mut reader: WsReader<S>,
    guard: &TeardownGuard,
) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut socket_read, mut socket_write) = socket.into_split();
    let mut stats = RelayStats::default();

    let to_tunnel = async {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match socket_read.read(&mut buffer).await {
                Ok(0) => return "local socket closed",
                Ok(n) => {
                    if peer.send_binary(buffer[..n].to_vec()).await.is_err() {
                        return "tunnel send failed";
                    }
                    stats.bytes_to_tunnel += n as u64;
                }
                Err(e) => {
                    if !is_benign_io(&e) {
                        debug!(error = %e, "Local socket read failed");
                    }
                    return "local socket read failed";
                }
            }
        }
    };

    let mut bytes_from_tunnel = 0u64;
    let from_tunnel = async {
        while let Some(frame) = reader.recv().await {
            match frame {
                Inbound::Binary(data) => {
                    if let Err(e) = socket_write.write_all(&data).await {
                        if !is_benign_io(&e) {
                            debug!(error = %e, "Local socket write failed");
                        }
                        return "local socket write failed";
                    }
                    bytes_from_tunnel += data.len() as u64;
                }
                Inbound::Text(text) => {
                    if is_error_message(&text) {
                        debug!(message = %text, "Tunnel error received while relaying");
                        return "tunnel error";
                    }
                    trace!("Ignoring control frame while relaying");
                }
            }
        }
        "tunnel closed"
    };

    let reason = tokio::select! {
        reason = to_tunnel => reason,
        reason = from_tunnel => reason,
        _ = guard.closed() => "teardown requested",
        _ = peer.closed() => "tunnel closed",
    };

    guard.close_both(reason);
    peer.close();
    let _ = socket_write.shutdown().await;

    stats.bytes_from_tunnel = bytes_from_tunnel;
    stats
}

fn is_error_message(text: &str) -> bool {
    decode(text).is_ok_and(|msg| {
        matches!(
            msg.kind(),
            MessageKind::ClientTunnelErr
                | MessageKind::AgentDataBindErr
                | MessageKind::TunnelCreateErr
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::WsConnection;
    use burrow_proto::{ControlMessage, RejectCode};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const TUNNEL_ID: &str = "5a8e1f2b-4c6d-4e3a-9b7f-0d1c2e3f4a5b";

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    async fn ws_pair() -> (
        WsConnection<tokio::io::DuplexStream>,
        WsConnection<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let addr = "127.0.0.1:9".parse().unwrap();
        let near = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let far = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WsConnection::new(near, addr), WsConnection::new(far, addr))
    }

    #[test]
    fn test_guard_fires_once() {
        let guard = TeardownGuard::new();
        assert_eq!(guard.reason(), None);
        assert!(guard.close_both("first"));
        assert!(!guard.close_both("second"));
        assert!(guard.is_closed());
        assert_eq!(guard.reason(), Some("first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_tears_down_once() {
        for _ in 0..100 {
            let guard = std::sync::Arc::new(TeardownGuard::new());
            let start = std::sync::Arc::new(tokio::sync::Barrier::new(16));

            let mut closers = Vec::new();
            for i in 0..16 {
                let guard = guard.clone();
                let start = start.clone();
                closers.push(tokio::spawn(async move {
                    start.wait().await;
                    guard.close_both(&format!("closer-{}", i))
                }));
            }

            let mut winners = 0;
            for closer in closers {
                if closer.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            assert!(guard.reason().unwrap().starts_with("closer-"));
        }
    }

    #[test]
    fn test_error_message_detection() {
        let err = burrow_proto::encode(&ControlMessage::client_err(
            TUNNEL_ID,
            RejectCode::HandshakeTimeout,
        ))
        .unwrap();
        assert!(is_error_message(&err));
        assert!(!is_error_message(r#"{"type":"AGENT_HEARTBEAT"}"#));
        assert!(!is_error_message("garbage"));
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut app, local) = socket_pair().await;
        let (near, mut far) = ws_pair().await;

        let guard = TeardownGuard::new();
        let relay_task = tokio::spawn(async move {
            let WsConnection { handle, reader } = near;
            relay(local, &handle, reader, &guard).await
        });

        app.write_all(b"hello").await.unwrap();
        assert_eq!(far.reader.recv().await, Some(Inbound::Binary(b"hello".to_vec())));

        far.handle.send_binary(b"world".to_vec()).await.unwrap();
        let mut buf = [0u8; 5];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(app);
        let stats = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.bytes_to_tunnel, 5);
        assert_eq!(stats.bytes_from_tunnel, 5);
        assert_eq!(far.reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_error_frame_tears_down() {
        let (mut app, local) = socket_pair().await;
        let (near, far) = ws_pair().await;

        let relay_task = tokio::spawn(async move {
            let guard = TeardownGuard::new();
            let WsConnection { handle, reader } = near;
            relay(local, &handle, reader, &guard).await;
            guard.is_closed()
        });

        far.handle
            .send_control(&ControlMessage::bind_err(TUNNEL_ID, RejectCode::AgentMismatch))
            .await
            .unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(closed);

        let mut buf = [0u8; 1];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_external_teardown_stops_relay() {
        let (_app, local) = socket_pair().await;
        let (near, _far) = ws_pair().await;

        let guard = std::sync::Arc::new(TeardownGuard::new());
        let relay_guard = guard.clone();
        let relay_task = tokio::spawn(async move {
            let WsConnection { handle, reader } = near;
            relay(local, &handle, reader, &relay_guard).await
        });

        assert!(guard.close_both("shutdown"));
        tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
    }
}
