//! Opens one tunnel WebSocket per local connection
//!
//! [`TunnelConnector::open`] runs the client handshake: connect to
//! `/ws/client/tunnel`, send `CLIENT_TUNNEL_OPEN` right away, then wait for
//! `CLIENT_TUNNEL_OK` or `CLIENT_TUNNEL_ERR`. Nothing is read from the local
//! socket until it returns, so callers can run their own "ready" step (the
//! SOCKS5 success reply) between `open` and [`TunnelConnector::relay`].

use std::sync::Arc;
use std::time::Duration;

use burrow_proto::{decode, ControlMessage};
use burrow_transport::{relay, ClientStream, Dialer, Inbound, RelayStats, WsConnection, WsReader};
use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ClientTunnelContext;
use crate::error::ClientError;

/// Upper bound on the whole OPEN -> OK exchange; the broker normally
/// answers well within its own pending timeout.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A tunnel whose handshake completed
pub struct OpenTunnel {
    pub context: Arc<ClientTunnelContext>,
    conn: WsConnection<ClientStream>,
}

impl std::fmt::Debug for OpenTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenTunnel")
            .field("tunnel_id", &self.context.tunnel_id)
            .finish()
    }
}

pub struct TunnelConnector {
    dialer: Dialer,
    agent_id: String,
    token: String,
    tunnels: DashMap<String, Arc<ClientTunnelContext>>,
}

impl std::fmt::Debug for TunnelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnector")
            .field("agent_id", &self.agent_id)
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

impl TunnelConnector {
    pub fn new(dialer: Dialer, agent_id: String, token: String) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            agent_id,
            token,
            tunnels: DashMap::new(),
        })
    }

    /// Tunnels that are handshaking or relaying
    pub fn live_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn close_all(&self, reason: &str) {
        for entry in self.tunnels.iter() {
            entry.value().close(reason);
        }
    }

    /// Handshake a new tunnel to `target_host:target_port`
    pub async fn open(&self, target_host: &str, target_port: u16) -> Result<OpenTunnel, ClientError> {
        let tunnel_id = Uuid::new_v4().to_string();
        let context = Arc::new(ClientTunnelContext::new(
            tunnel_id.clone(),
            target_host.to_string(),
            target_port,
        ));
        self.tunnels.insert(tunnel_id.clone(), context.clone());

        match self.handshake(&context).await {
            Ok(conn) => {
                context.mark_ready();
                info!(
                    tunnel_id = %tunnel_id,
                    agent_id = %self.agent_id,
                    target = %format!("{}:{}", target_host, target_port),
                    handshake_ms = context.age_ms(),
                    "Tunnel ready"
                );
                Ok(OpenTunnel { context, conn })
            }
            Err(e) => {
                context.close("handshake failed");
                self.forget(&context);
                Err(e)
            }
        }
    }

    /// Relay between the local socket and an opened tunnel until either
    /// side closes
    pub async fn relay(&self, tunnel: OpenTunnel, socket: TcpStream) -> RelayStats {
        let OpenTunnel { context, conn } = tunnel;
        let stats = relay(socket, &conn.handle, conn.reader, &context.guard).await;
        self.forget(&context);

        info!(
            tunnel_id = %context.tunnel_id,
            reason = context.guard.reason().unwrap_or("unknown"),
            bytes_sent = stats.bytes_to_tunnel,
            bytes_received = stats.bytes_from_tunnel,
            "Tunnel closed"
        );
        stats
    }

    fn forget(&self, context: &Arc<ClientTunnelContext>) {
        self.tunnels
            .remove_if(&context.tunnel_id, |_, c| Arc::ptr_eq(c, context));
    }

    async fn handshake(
        &self,
        context: &ClientTunnelContext,
    ) -> Result<WsConnection<ClientStream>, ClientError> {
        let mut conn = tokio::select! {
            conn = self.dialer.connect(burrow_proto::CLIENT_TUNNEL_PATH) => conn?,
            _ = context.guard.closed() => return Err(ClientError::Cancelled),
        };

        let open = ControlMessage::ClientTunnelOpen {
            tunnel_id: context.tunnel_id.clone(),
            agent_id: self.agent_id.clone(),
            target_host: context.target_host.clone(),
            target_port: context.target_port,
            token: self.token.clone(),
        };

        let outcome = match conn.handle.send_control(&open).await {
            Ok(()) => tokio::select! {
                outcome = tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    wait_for_ok(&mut conn.reader, &context.tunnel_id),
                ) => outcome.unwrap_or(Err(ClientError::HandshakeTimeout)),
                _ = context.guard.closed() => Err(ClientError::Cancelled),
            },
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.handle.close();
                Err(e)
            }
        }
    }
}

async fn wait_for_ok<S>(reader: &mut WsReader<S>, tunnel_id: &str) -> Result<(), ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = reader.recv().await {
        let text = match frame {
            Inbound::Text(text) => text,
            Inbound::Binary(_) => {
                warn!(tunnel_id = %tunnel_id, "Payload before CLIENT_TUNNEL_OK");
                return Err(ClientError::PayloadBeforeReady);
            }
        };

        match decode(&text) {
            Ok(ControlMessage::ClientTunnelOk { .. }) => return Ok(()),
            Ok(ControlMessage::ClientTunnelErr { code, message, .. }) => {
                warn!(tunnel_id = %tunnel_id, code = code, reason = %message, "Tunnel rejected");
                return Err(ClientError::Rejected { code, message });
            }
            Ok(other) => {
                debug!(tunnel_id = %tunnel_id, kind = %other.kind(), "Ignoring message during handshake");
            }
            Err(e) if e.is_unknown_type() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(ClientError::HandshakeClosed)
}
