//! Outgoing WebSocket connections to the broker

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};
use url::Url;

use crate::connection::WsConnection;
use crate::error::{TransportError, TransportResult};
use crate::tls::ClientTlsConfig;
use crate::ws_config;

/// Stream type of every connection made by [`Dialer`]
pub type ClientStream = MaybeTlsStream<TcpStream>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens WebSocket connections to one broker base URL (`ws[s]://host:port`)
#[derive(Clone)]
pub struct Dialer {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Dialer {
    pub fn new(server_url: &str, tls: &ClientTlsConfig) -> TransportResult<Self> {
        let url = Url::parse(server_url).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid server URL {}: {}", server_url, e))
        })?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme {:?}, expected ws or wss",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                TransportError::ConfigurationError(format!("Missing host in {}", server_url))
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::ConfigurationError(format!("Missing port in {}", server_url))
        })?;

        let tls = if secure {
            Some(tls.build_connector()?)
        } else {
            None
        };

        Ok(Self { host, port, tls })
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect and upgrade on `path`
    pub async fn connect(&self, path: &str) -> TransportResult<WsConnection<ClientStream>> {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let url = format!("{}://{}{}", scheme, self.authority(), path);

        debug!("Connecting to {}", url);

        let (stream, remote_addr) = tokio::time::timeout(CONNECT_TIMEOUT, self.open_stream())
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (ws_stream, _response) =
            tokio_tungstenite::client_async_with_config(url.as_str(), stream, Some(ws_config()))
                .await
                .map_err(|e| {
                    TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
                })?;

        info!("WebSocket connection established to {}", url);

        Ok(WsConnection::new(ws_stream, remote_addr))
    }

    async fn open_stream(&self) -> TransportResult<(ClientStream, SocketAddr)> {
        let tcp_stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        tcp_stream.set_nodelay(true)?;
        let remote_addr = tcp_stream.peer_addr()?;

        let stream = match &self.tls {
            None => MaybeTlsStream::Plain(tcp_stream),
            Some(connector) => {
                let dns_name = ServerName::try_from(self.host.clone())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;
                let tls_stream = connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                MaybeTlsStream::Rustls(tls_stream)
            }
        };

        Ok((stream, remote_addr))
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
