//! Per-connection handshake sessions
//!
//! Every inbound connection is driven by one session loop. In its first
//! state a session accepts exactly one designated control message; anything
//! else (another type, a malformed payload, an early binary frame) closes
//! the connection. Once the handshake is accepted, binary frames are relayed
//! to the matched peer and stray control messages are ignored, except
//! `*_ERR` which ends the tunnel.

use std::sync::Arc;

use burrow_proto::{decode, ControlMessage, MessageKind, ProtocolError, RejectCode};
use burrow_transport::{Inbound, PeerHandle, WsConnection};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::tunnel_registry::{BindRequest, OpenRequest, TunnelRegistry};

/// Which kind of inbound connection a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    AgentControl,
    AgentData,
    ClientTunnel,
}

impl Route {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            burrow_proto::AGENT_CONTROL_PATH => Some(Route::AgentControl),
            burrow_proto::AGENT_DATA_PATH => Some(Route::AgentData),
            burrow_proto::CLIENT_TUNNEL_PATH => Some(Route::ClientTunnel),
            _ => None,
        }
    }
}

/// Drive a connection to completion according to its route
pub async fn run<S>(route: Route, conn: WsConnection<S>, registry: Arc<TunnelRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match route {
        Route::AgentControl => AgentControlSession::new(registry).run(conn).await,
        Route::AgentData => AgentDataSession::new(registry).run(conn).await,
        Route::ClientTunnel => ClientTunnelSession::new(registry).run(conn).await,
    }
}

fn log_bad_frame(conn: &PeerHandle, route: Route, err: &ProtocolError) {
    warn!(
        conn = %conn.id(),
        remote_addr = %conn.remote_addr(),
        route = ?route,
        error = %err,
        "Closing connection after invalid control frame"
    );
}

/// `/ws/agent/control`: registration, create errors and heartbeats
struct AgentControlSession {
    registry: Arc<TunnelRegistry>,
    agent_id: Option<String>,
}

impl AgentControlSession {
    fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self {
            registry,
            agent_id: None,
        }
    }

    async fn run<S>(mut self, mut conn: WsConnection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = conn.handle.clone();

        while let Some(frame) = conn.reader.recv().await {
            let keep_going = match frame {
                Inbound::Text(text) => self.on_text(&handle, &text).await,
                Inbound::Binary(_) => {
                    warn!(conn = %handle.id(), "Binary frame on control connection");
                    false
                }
            };
            if !keep_going {
                handle.close();
                break;
            }
        }

        if let Some(agent_id) = self.agent_id.take() {
            self.registry.agents().unregister(&agent_id, &handle);
        }
        debug!(conn = %handle.id(), "Agent control connection closed");
    }

    async fn on_text(&mut self, handle: &PeerHandle, text: &str) -> bool {
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) if e.is_unknown_type() && self.agent_id.is_some() => {
                debug!(conn = %handle.id(), error = %e, "Ignoring unknown control message");
                return true;
            }
            Err(e) => {
                log_bad_frame(handle, Route::AgentControl, &e);
                return false;
            }
        };

        let Some(agent_id) = self.agent_id.clone() else {
            return self.on_register(handle, message).await;
        };

        self.registry.agents().touch(&agent_id, handle);
        match message {
            ControlMessage::AgentHeartbeat => {}
            ControlMessage::TunnelCreateErr {
                tunnel_id,
                code,
                message,
            } => {
                self.registry
                    .handle_agent_create_err(&agent_id, &tunnel_id, code, &message)
                    .await;
            }
            other => {
                debug!(
                    agent_id = %agent_id,
                    kind = %other.kind(),
                    "Ignoring unexpected control message"
                );
            }
        }
        true
    }

    async fn on_register(&mut self, handle: &PeerHandle, message: ControlMessage) -> bool {
        let ControlMessage::AgentRegister { agent_id, token } = message else {
            warn!(
                conn = %handle.id(),
                kind = %message.kind(),
                "Expected AGENT_REGISTER as first message"
            );
            return false;
        };

        if !self.registry.token_matches(&token) {
            warn!(
                agent_id = %agent_id,
                remote_addr = %handle.remote_addr(),
                code = RejectCode::BadToken.code(),
                reason = %RejectCode::BadToken,
                "Rejecting agent registration"
            );
            handle
                .send_and_close(&ControlMessage::register_err(RejectCode::BadToken))
                .await;
            return false;
        }

        self.registry.agents().register(&agent_id, handle.clone());
        self.agent_id = Some(agent_id);
        handle
            .send_control(&ControlMessage::AgentRegisterOk)
            .await
            .is_ok()
    }
}

/// `/ws/agent/data`: one bind, then payload towards the client
struct AgentDataSession {
    registry: Arc<TunnelRegistry>,
    tunnel_id: Option<String>,
    client: Option<PeerHandle>,
}

impl AgentDataSession {
    fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self {
            registry,
            tunnel_id: None,
            client: None,
        }
    }

    async fn run<S>(mut self, mut conn: WsConnection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = conn.handle.clone();

        while let Some(frame) = conn.reader.recv().await {
            let keep_going = match frame {
                Inbound::Text(text) => self.on_text(&handle, &text).await,
                Inbound::Binary(data) => self.on_binary(&handle, data).await,
            };
            if !keep_going {
                handle.close();
                break;
            }
        }

        if let Some(tunnel_id) = self.tunnel_id.take() {
            self.registry.handle_agent_data_inactive(&tunnel_id, &handle);
        }
    }

    async fn on_text(&mut self, handle: &PeerHandle, text: &str) -> bool {
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) if e.is_unknown_type() && self.tunnel_id.is_some() => return true,
            Err(e) => {
                log_bad_frame(handle, Route::AgentData, &e);
                return false;
            }
        };

        if let Some(tunnel_id) = &self.tunnel_id {
            return match message.kind() {
                MessageKind::AgentDataBindErr | MessageKind::ClientTunnelErr => {
                    info!(tunnel_id = %tunnel_id, "Agent ended tunnel with error");
                    false
                }
                kind => {
                    debug!(tunnel_id = %tunnel_id, kind = %kind, "Ignoring control message on data connection");
                    true
                }
            };
        }

        let ControlMessage::AgentDataBind {
            tunnel_id,
            agent_id,
            token,
        } = message
        else {
            warn!(
                conn = %handle.id(),
                kind = %message.kind(),
                "Expected AGENT_DATA_BIND as first message"
            );
            return false;
        };

        let bind = BindRequest {
            tunnel_id: tunnel_id.clone(),
            agent_id,
            token,
        };
        match self.registry.handle_agent_data_bind(bind, handle).await {
            Ok(()) => {
                self.tunnel_id = Some(tunnel_id);
                true
            }
            Err(_) => false,
        }
    }

    async fn on_binary(&mut self, handle: &PeerHandle, data: Vec<u8>) -> bool {
        let Some(tunnel_id) = &self.tunnel_id else {
            warn!(conn = %handle.id(), "Binary frame before AGENT_DATA_BIND");
            return false;
        };

        if self.client.is_none() {
            self.client = self.registry.client_peer_for(tunnel_id, handle);
        }
        forward(self.client.as_ref(), data, tunnel_id).await
    }
}

/// `/ws/client/tunnel`: one open, then payload towards the agent
struct ClientTunnelSession {
    registry: Arc<TunnelRegistry>,
    tunnel_id: Option<String>,
    agent_data: Option<PeerHandle>,
}

impl ClientTunnelSession {
    fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self {
            registry,
            tunnel_id: None,
            agent_data: None,
        }
    }

    async fn run<S>(mut self, mut conn: WsConnection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = conn.handle.clone();

        while let Some(frame) = conn.reader.recv().await {
            let keep_going = match frame {
                Inbound::Text(text) => self.on_text(&handle, &text).await,
                Inbound::Binary(data) => self.on_binary(&handle, data).await,
            };
            if !keep_going {
                handle.close();
                break;
            }
        }

        if let Some(tunnel_id) = self.tunnel_id.take() {
            self.registry.handle_client_inactive(&tunnel_id, &handle);
        }
    }

    async fn on_text(&mut self, handle: &PeerHandle, text: &str) -> bool {
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) if self.tunnel_id.is_some() => {
                debug!(conn = %handle.id(), error = %e, "Ignoring undecodable control frame");
                return true;
            }
            Err(e) => {
                log_bad_frame(handle, Route::ClientTunnel, &e);
                return false;
            }
        };

        if let Some(tunnel_id) = &self.tunnel_id {
            return match message.kind() {
                MessageKind::ClientTunnelErr => {
                    info!(tunnel_id = %tunnel_id, "Client ended tunnel with error");
                    false
                }
                kind => {
                    debug!(tunnel_id = %tunnel_id, kind = %kind, "Ignoring control message on tunnel connection");
                    true
                }
            };
        }

        let ControlMessage::ClientTunnelOpen {
            tunnel_id,
            agent_id,
            target_host,
            target_port,
            token,
        } = message
        else {
            warn!(
                conn = %handle.id(),
                kind = %message.kind(),
                "Expected CLIENT_TUNNEL_OPEN as first message"
            );
            return false;
        };

        let open = OpenRequest {
            tunnel_id: tunnel_id.clone(),
            agent_id,
            target_host,
            target_port,
            token,
        };
        match self.registry.handle_client_open(open, handle).await {
            Ok(()) => {
                self.tunnel_id = Some(tunnel_id);
                true
            }
            Err(_) => false,
        }
    }

    async fn on_binary(&mut self, handle: &PeerHandle, data: Vec<u8>) -> bool {
        let Some(tunnel_id) = &self.tunnel_id else {
            warn!(conn = %handle.id(), "Binary frame before CLIENT_TUNNEL_OPEN");
            return false;
        };

        if self.agent_data.is_none() {
            self.agent_data = self.registry.agent_peer_for(tunnel_id, handle);
        }
        forward(self.agent_data.as_ref(), data, tunnel_id).await
    }
}

/// Pass a payload frame to the far side; a missing or dead peer drops the
/// frame and ends the source connection
async fn forward(peer: Option<&PeerHandle>, data: Vec<u8>, tunnel_id: &str) -> bool {
    match peer {
        Some(peer) if peer.is_active() => peer.send_binary(data).await.is_ok(),
        _ => {
            debug!(tunnel_id = %tunnel_id, bytes = data.len(), "No live peer, dropping frame");
            false
        }
    }
}
