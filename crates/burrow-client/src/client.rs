use std::net::SocketAddr;
use std::sync::Arc;

use burrow_transport::Dialer;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ClientConfig, ForwardRule};
use crate::connector::TunnelConnector;
use crate::error::ClientError;
use crate::forward::run_forward;
use crate::socks5::run_socks5;

enum Listener {
    Forward(TcpListener, ForwardRule),
    Socks5(TcpListener),
}

/// A client with all of its local listeners bound
pub struct Client {
    connector: Arc<TunnelConnector>,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connector", &self.connector)
            .field("listeners", &self.local_addrs())
            .finish()
    }
}

impl Client {
    /// Validate the configuration and bind every listener
    pub async fn bind(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let dialer = Dialer::new(&config.server_url, &config.tls)?;
        let connector = TunnelConnector::new(dialer, config.agent_id.clone(), config.token.clone());

        let mut listeners = Vec::new();
        for rule in &config.forwards {
            let listener = bind_listener(&rule.listen_host, rule.listen_port).await?;
            listeners.push(Listener::Forward(listener, rule.clone()));
        }
        for socks in &config.socks5 {
            let listener = bind_listener(&socks.listen_host, socks.listen_port).await?;
            listeners.push(Listener::Socks5(listener));
        }

        info!(
            server = %config.server_url,
            agent_id = %config.agent_id,
            forwards = config.forwards.len(),
            socks5 = config.socks5.len(),
            "Client listeners bound"
        );

        Ok(Self {
            connector,
            listeners,
        })
    }

    /// Bound addresses, forwards first then SOCKS5, in configuration order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| match listener {
                Listener::Forward(l, _) | Listener::Socks5(l) => l.local_addr().ok(),
            })
            .collect()
    }

    pub fn connector(&self) -> &Arc<TunnelConnector> {
        &self.connector
    }

    /// Serve until `shutdown` fires, then close every live tunnel
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        for listener in self.listeners {
            let connector = self.connector.clone();
            let shutdown = shutdown.clone();
            match listener {
                Listener::Forward(listener, rule) => {
                    tasks.spawn(run_forward(listener, rule, connector, shutdown));
                }
                Listener::Socks5(listener) => {
                    tasks.spawn(run_socks5(listener, connector, shutdown));
                }
            }
        }

        while tasks.join_next().await.is_some() {}

        self.connector.close_all("client shutting down");
        info!("Client stopped");
    }
}

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, ClientError> {
    let address = format!("{}:{}", host, port);
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ClientError::ListenFailed {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ClientError::ListenFailed {
            address: address.clone(),
            source: std::io::ErrorKind::AddrNotAvailable.into(),
        })?;

    Ok(burrow_transport::bind(addr).await?)
}
