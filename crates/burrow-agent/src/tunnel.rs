//! Agent-side tunnels: dial the target, bind a data connection, relay
//!
//! Each `TUNNEL_CREATE` becomes one [`TunnelContext`] in the manager's map
//! and one task that walks it through dial -> data connect -> bind -> relay.
//! Failures before the bind are reported on the control connection as
//! `TUNNEL_CREATE_ERR`; the broker forwards them to the waiting client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_proto::{decode, ControlMessage, RejectCode};
use burrow_transport::{relay, Dialer, Inbound, PeerHandle, TeardownGuard, WsReader};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::AgentError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const BIND_TIMEOUT: Duration = Duration::from_secs(30);

/// Local state of one tunnel on the agent
#[derive(Debug)]
pub struct TunnelContext {
    pub tunnel_id: String,
    pub target: String,
    guard: TeardownGuard,
    bound: AtomicBool,
    created_at: Instant,
}

impl TunnelContext {
    fn new(tunnel_id: String, target: String) -> Self {
        Self {
            tunnel_id,
            target,
            guard: TeardownGuard::new(),
            bound: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Broker acknowledged the bind; target reads are enabled
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// Close both sides; returns true for the call that did it
    pub fn close(&self, reason: &str) -> bool {
        let closed = self.guard.close_both(reason);
        if closed {
            debug!(tunnel_id = %self.tunnel_id, reason = %reason, "Closing agent tunnel");
        }
        closed
    }
}

/// Tracks the tunnels an agent is serving
pub struct TunnelManager {
    agent_id: String,
    token: String,
    dialer: Dialer,
    control: PeerHandle,
    tunnels: DashMap<String, Arc<TunnelContext>>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("agent_id", &self.agent_id)
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

impl TunnelManager {
    pub fn new(agent_id: String, token: String, dialer: Dialer, control: PeerHandle) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            token,
            dialer,
            control,
            tunnels: DashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Start a tunnel for `TUNNEL_CREATE`; a repeated id is ignored
    pub fn handle_create(self: &Arc<Self>, tunnel_id: String, target_host: String, target_port: u16) {
        let target = format!("{}:{}", target_host, target_port);
        let context = match self.tunnels.entry(tunnel_id.clone()) {
            Entry::Occupied(_) => {
                warn!(tunnel_id = %tunnel_id, "Duplicate TUNNEL_CREATE ignored");
                return;
            }
            Entry::Vacant(slot) => slot
                .insert(Arc::new(TunnelContext::new(tunnel_id, target)))
                .clone(),
        };

        info!(tunnel_id = %context.tunnel_id, target = %context.target, "Creating tunnel");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_tunnel(&context, &target_host, target_port).await;
            context.close("tunnel finished");
            manager
                .tunnels
                .remove_if(&context.tunnel_id, |_, c| Arc::ptr_eq(c, &context));
        });
    }

    /// Tear down every tunnel, e.g. on shutdown
    pub fn close_all(&self, reason: &str) {
        for entry in self.tunnels.iter() {
            entry.value().close(reason);
        }
    }

    async fn run_tunnel(&self, context: &Arc<TunnelContext>, host: &str, port: u16) {
        let tunnel_id = context.tunnel_id.as_str();

        let target = match dial_target(host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "Target dial failed");
                self.report_failure(context, RejectCode::DialFailed).await;
                return;
            }
        };

        let mut data = match self.dialer.connect(burrow_proto::AGENT_DATA_PATH).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "Data connection failed");
                self.report_failure(context, RejectCode::DataConnectFailed).await;
                return;
            }
        };

        let bind = ControlMessage::AgentDataBind {
            tunnel_id: tunnel_id.to_string(),
            agent_id: self.agent_id.clone(),
            token: self.token.clone(),
        };
        if let Err(e) = data.handle.send_control(&bind).await {
            warn!(tunnel_id = %tunnel_id, error = %e, "Failed to send AGENT_DATA_BIND");
            self.report_failure(context, RejectCode::DataConnectFailed).await;
            return;
        }

        let bound = tokio::select! {
            bound = tokio::time::timeout(BIND_TIMEOUT, wait_for_bind_ok(&mut data.reader, tunnel_id)) => {
                bound.unwrap_or_else(|_| {
                    warn!(tunnel_id = %tunnel_id, "No bind reply from server");
                    false
                })
            }
            _ = context.guard.closed() => false,
        };
        if !bound {
            data.handle.close();
            return;
        }

        context.bound.store(true, Ordering::Release);
        info!(
            tunnel_id = %tunnel_id,
            target = %context.target,
            setup_ms = context.created_at.elapsed().as_millis() as u64,
            "Tunnel bound, relaying"
        );

        let stats = relay(target, &data.handle, data.reader, &context.guard).await;

        info!(
            tunnel_id = %tunnel_id,
            reason = context.guard.reason().unwrap_or("unknown"),
            bytes_to_server = stats.bytes_to_tunnel,
            bytes_to_target = stats.bytes_from_tunnel,
            "Tunnel closed"
        );
    }

    async fn report_failure(&self, context: &TunnelContext, code: RejectCode) {
        context.close(code.reason());
        let err = ControlMessage::create_err(context.tunnel_id.as_str(), code);
        if let Err(e) = self.control.send_control(&err).await {
            debug!(tunnel_id = %context.tunnel_id, error = %e, "Could not report tunnel failure");
        }
    }
}

async fn dial_target(host: &str, port: u16) -> Result<TcpStream, AgentError> {
    let address = format!("{}:{}", host, port);
    let connect = TcpStream::connect((host, port));
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(AgentError::DialFailed { address, source }),
        Err(_) => {
            return Err(AgentError::DialFailed {
                address,
                source: std::io::ErrorKind::TimedOut.into(),
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(address = %address, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Wait for the broker's answer to `AGENT_DATA_BIND`
async fn wait_for_bind_ok<S>(reader: &mut WsReader<S>, tunnel_id: &str) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = reader.recv().await {
        let text = match frame {
            Inbound::Text(text) => text,
            Inbound::Binary(_) => {
                warn!(tunnel_id = %tunnel_id, "Payload before AGENT_DATA_BIND_OK");
                return false;
            }
        };

        match decode(&text) {
            Ok(ControlMessage::AgentDataBindOk { .. }) => return true,
            Ok(ControlMessage::AgentDataBindErr { code, message, .. }) => {
                warn!(tunnel_id = %tunnel_id, code = code, reason = %message, "Bind rejected");
                return false;
            }
            Ok(other) => {
                debug!(tunnel_id = %tunnel_id, kind = %other.kind(), "Ignoring message while binding");
            }
            Err(e) if e.is_unknown_type() => {}
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "Invalid frame while binding");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_transport::{accept_routed, ClientTlsConfig};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    const TUNNEL_ID: &str = "0b6f3c1e-2a4d-4e5f-8a9b-0c1d2e3f4a5b";

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn manager(server_url: &str) -> (Arc<TunnelManager>, mpsc::Receiver<Message>) {
        let (control, rx) = PeerHandle::channel("127.0.0.1:0".parse().unwrap());
        let dialer = Dialer::new(server_url, &ClientTlsConfig::default()).unwrap();
        let manager = TunnelManager::new(
            "agent-test".to_string(),
            "secret".to_string(),
            dialer,
            control,
        );
        (manager, rx)
    }

    async fn next_error(rx: &mut mpsc::Receiver<Message>) -> ControlMessage {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            Message::Text(text) => decode(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_dial_failed() {
        let port = refused_port().await;
        let (manager, mut rx) = manager("ws://127.0.0.1:1");

        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), port);

        match next_error(&mut rx).await {
            ControlMessage::TunnelCreateErr {
                tunnel_id,
                code,
                message,
            } => {
                assert_eq!(tunnel_id, TUNNEL_ID);
                assert_eq!(code, 502);
                assert_eq!(message, "DIAL_FAILED");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_data_ws_failed() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let server_port = refused_port().await;
        let (manager, mut rx) = manager(&format!("ws://127.0.0.1:{}", server_port));

        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), target_port);

        match next_error(&mut rx).await {
            ControlMessage::TunnelCreateErr { code, message, .. } => {
                assert_eq!(code, 502);
                assert_eq!(message, "DATA_WS_FAILED");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_is_ignored() {
        let (manager, _rx) = manager("ws://127.0.0.1:1");

        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), 1);
        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), 2);

        // Neither task has run yet on the single-threaded runtime
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_tunnel_is_removed() {
        let port = refused_port().await;
        let (manager, mut rx) = manager("ws://127.0.0.1:1");

        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), port);
        next_error(&mut rx).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_payload_before_bind_ok_tears_down() {
        let wait = Duration::from_secs(5);
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let server = burrow_transport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_port = server.local_addr().unwrap().port();
        let (manager, _rx) = manager(&format!("ws://127.0.0.1:{}", server_port));

        manager.handle_create(TUNNEL_ID.to_string(), "127.0.0.1".to_string(), target_port);

        let (mut dialed, _) = tokio::time::timeout(wait, target.accept())
            .await
            .unwrap()
            .unwrap();
        let (tcp, remote_addr) = tokio::time::timeout(wait, server.accept())
            .await
            .unwrap()
            .unwrap();
        let (mut data, ()) = accept_routed(tcp, remote_addr, |_: &str| Some(()))
            .await
            .unwrap();

        match tokio::time::timeout(wait, data.reader.recv()).await.unwrap() {
            Some(Inbound::Text(text)) => assert!(matches!(
                decode(&text).unwrap(),
                ControlMessage::AgentDataBind { .. }
            )),
            other => panic!("expected AGENT_DATA_BIND, got {:?}", other),
        }
        data.handle.send_binary(b"too early".to_vec()).await.unwrap();

        // Data connection and target socket both closed, nothing relayed
        assert_eq!(
            tokio::time::timeout(wait, data.reader.recv()).await.unwrap(),
            None
        );
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(wait, dialed.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "target got {:?}", read);

        tokio::time::timeout(wait, async {
            while !manager.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_context_close_is_one_shot() {
        let context = TunnelContext::new(TUNNEL_ID.to_string(), "127.0.0.1:80".to_string());
        assert!(!context.is_bound());
        assert!(context.close("first"));
        assert!(!context.close("second"));
    }
}
