use std::sync::Arc;
use std::time::Duration;

use burrow_proto::{decode, ControlMessage};
use burrow_transport::{ClientStream, ClientTlsConfig, Dialer, Inbound, PeerHandle, WsConnection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::tunnel::TunnelManager;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat period on the control connection
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity the agent registers under
    pub agent_id: String,

    /// Broker base URL (`ws://` or `wss://`)
    pub server_url: String,

    /// Shared secret
    pub token: String,

    pub tls: ClientTlsConfig,

    /// `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

impl AgentConfig {
    pub fn new(
        agent_id: impl Into<String>,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            server_url: server_url.into(),
            token: token.into(),
            tls: ClientTlsConfig::default(),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

/// Outbound side of a tunnel: keeps a control connection to the broker and
/// serves `TUNNEL_CREATE` requests by dialing local targets.
pub struct Agent {
    config: AgentConfig,
    dialer: Dialer,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.config.agent_id)
            .field("server_url", &self.config.server_url)
            .finish()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.agent_id.is_empty() || config.agent_id.len() > burrow_proto::MAX_AGENT_ID_LEN {
            return Err(AgentError::InvalidConfig(format!(
                "agent id must be 1..={} characters",
                burrow_proto::MAX_AGENT_ID_LEN
            )));
        }
        let dialer = Dialer::new(&config.server_url, &config.tls)?;
        Ok(Self { config, dialer })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Register and serve until the control connection drops or `shutdown`
    /// fires. Returns `Ok` only for a requested shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        info!(
            agent_id = %self.config.agent_id,
            server = %self.config.server_url,
            "Connecting to tunnel server"
        );

        let mut control = self.dialer.connect(burrow_proto::AGENT_CONTROL_PATH).await?;

        let registered = tokio::select! {
            result = self.register(&mut control) => result,
            _ = shutdown.cancelled() => {
                control.handle.close();
                return Ok(());
            }
        };
        if let Err(e) = registered {
            control.handle.close();
            return Err(e);
        }

        info!(agent_id = %self.config.agent_id, "Agent registered");

        let manager = TunnelManager::new(
            self.config.agent_id.clone(),
            self.config.token.clone(),
            self.dialer.clone(),
            control.handle.clone(),
        );

        let heartbeat = self
            .config
            .heartbeat_interval
            .map(|interval| tokio::spawn(heartbeat_loop(control.handle.clone(), interval)));

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing control connection");
                    break Ok(());
                }
                frame = control.reader.recv() => frame,
            };

            match frame {
                Some(Inbound::Text(text)) => self.dispatch(&manager, &text),
                Some(Inbound::Binary(_)) => {
                    debug!("Ignoring binary frame on control connection");
                }
                None => {
                    warn!("Control connection closed by server");
                    break Err(AgentError::ControlClosed);
                }
            }
        };

        if let Some(task) = heartbeat {
            task.abort();
        }
        manager.close_all("control connection closed");
        control.handle.close();
        result
    }

    async fn register(&self, control: &mut WsConnection<ClientStream>) -> Result<(), AgentError> {
        let register = ControlMessage::AgentRegister {
            agent_id: self.config.agent_id.clone(),
            token: self.config.token.clone(),
        };
        control.handle.send_control(&register).await?;

        tokio::time::timeout(REGISTER_TIMEOUT, wait_for_registration(control))
            .await
            .map_err(|_| {
                AgentError::RegistrationFailed("timed out waiting for AGENT_REGISTER_OK".into())
            })?
    }

    fn dispatch(&self, manager: &Arc<TunnelManager>, text: &str) {
        match decode(text) {
            Ok(ControlMessage::TunnelCreate {
                tunnel_id,
                target_host,
                target_port,
            }) => manager.handle_create(tunnel_id, target_host, target_port),
            Ok(other) => debug!(kind = %other.kind(), "Ignoring control message"),
            Err(e) if e.is_unknown_type() => debug!(error = %e, "Ignoring unknown message"),
            Err(e) => warn!(error = %e, "Invalid control message"),
        }
    }
}

async fn wait_for_registration(control: &mut WsConnection<ClientStream>) -> Result<(), AgentError> {
    while let Some(frame) = control.reader.recv().await {
        let Inbound::Text(text) = frame else {
            continue;
        };
        match decode(&text) {
            Ok(ControlMessage::AgentRegisterOk) => return Ok(()),
            Ok(ControlMessage::AgentRegisterErr { code, message }) => {
                error!(code = code, reason = %message, "Registration rejected");
                return Err(AgentError::RegistrationRejected { code, message });
            }
            Ok(other) => debug!(kind = %other.kind(), "Ignoring message before registration"),
            Err(e) => debug!(error = %e, "Ignoring frame before registration"),
        }
    }
    Err(AgentError::ControlClosed)
}

async fn heartbeat_loop(control: PeerHandle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = control.closed() => return,
        }
        if control.send_control(&ControlMessage::AgentHeartbeat).await.is_err() {
            return;
        }
        debug!("Heartbeat sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::new("agent-1", "ws://localhost:8080", "secret");
        assert_eq!(config.heartbeat_interval, Some(DEFAULT_HEARTBEAT_INTERVAL));
        assert!(!config.tls.insecure);
    }

    #[test]
    fn test_rejects_bad_agent_id() {
        let config = AgentConfig::new("", "ws://localhost:8080", "secret");
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidConfig(_))
        ));

        let config = AgentConfig::new("a".repeat(129), "ws://localhost:8080", "secret");
        assert!(Agent::new(config).is_err());
    }

    #[test]
    fn test_rejects_bad_server_url() {
        let config = AgentConfig::new("agent-1", "http://localhost:8080", "secret");
        assert!(matches!(Agent::new(config), Err(AgentError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_sends_until_closed() {
        let (handle, mut rx) = PeerHandle::channel("127.0.0.1:0".parse().unwrap());
        let task = tokio::spawn(heartbeat_loop(handle.clone(), Duration::from_secs(30)));

        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            assert!(frame.to_string().contains("AGENT_HEARTBEAT"));
        }

        handle.close();
        task.await.unwrap();
    }
}
