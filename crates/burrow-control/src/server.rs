//! Broker accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_transport::{accept_routed, ServerTlsConfig, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_registry::AgentRegistry;
use crate::session::{self, Route};
use crate::tunnel_registry::TunnelRegistry;

/// Default time a pending tunnel waits for its agent bind
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the TLS accept plus WebSocket upgrade of a new connection
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub token: String,
    pub pending_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tls: Option<ServerTlsConfig>,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            bind_addr,
            token: token.into(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
        }
    }
}

/// A bound broker, ready to accept connections
pub struct TunnelServer {
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    registry: Arc<TunnelRegistry>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("local_addr", &self.listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl TunnelServer {
    pub async fn bind(config: ServerConfig) -> TransportResult<Self> {
        let tls_acceptor = config
            .tls
            .as_ref()
            .map(ServerTlsConfig::build_acceptor)
            .transpose()?;

        let listener = burrow_transport::bind(config.bind_addr).await?;

        let agents = Arc::new(AgentRegistry::new());
        let registry = TunnelRegistry::new(config.token, agents, config.pending_timeout);

        info!(
            addr = %listener.local_addr()?,
            tls = tls_acceptor.is_some(),
            pending_timeout_ms = config.pending_timeout.as_millis() as u64,
            "Tunnel server listening"
        );

        Ok(Self {
            listener,
            tls_acceptor,
            registry,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (tcp_stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            debug!("Incoming TCP connection from {}", remote_addr);
            let registry = self.registry.clone();
            let tls_acceptor = self.tls_acceptor.clone();
            let shutdown = shutdown.clone();
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                handle_tcp(
                    tcp_stream,
                    remote_addr,
                    tls_acceptor,
                    handshake_timeout,
                    registry,
                    shutdown,
                )
                .await;
            });
        }

        info!("Tunnel server stopped accepting connections");
    }
}

async fn handle_tcp(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) {
    if let Err(e) = tcp_stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
    }

    // One deadline covers both the TLS accept and the upgrade
    let deadline = tokio::time::Instant::now() + handshake_timeout;
    match tls_acceptor {
        None => serve(tcp_stream, remote_addr, deadline, registry, shutdown).await,
        Some(acceptor) => {
            match tokio::time::timeout_at(deadline, acceptor.accept(tcp_stream)).await {
                Ok(Ok(tls_stream)) => {
                    serve(tls_stream, remote_addr, deadline, registry, shutdown).await
                }
                Ok(Err(e)) => warn!("TLS handshake failed from {}: {}", remote_addr, e),
                Err(_) => warn!("TLS handshake timed out from {}", remote_addr),
            }
        }
    }
}

async fn serve<S>(
    stream: S,
    remote_addr: SocketAddr,
    deadline: tokio::time::Instant,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upgrade = accept_routed(stream, remote_addr, Route::from_path);
    let (conn, route) = match tokio::time::timeout_at(deadline, upgrade).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            debug!("WebSocket handshake failed from {}: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake timed out from {}", remote_addr);
            return;
        }
    };

    debug!(remote_addr = %remote_addr, route = ?route, "WebSocket connection established");

    let handle = conn.handle.clone();
    let session = session::run(route, conn, registry);
    tokio::pin!(session);

    tokio::select! {
        _ = &mut session => return,
        _ = shutdown.cancelled() => handle.close(),
    }
    session.await;
}
