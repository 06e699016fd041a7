use burrow_proto::ProtocolError;
use burrow_transport::TransportError;
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid --forward rule '{0}'")]
    InvalidForward(String),

    #[error("Invalid --socks5 listen address '{0}'")]
    InvalidSocks5(String),

    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to listen on {address}: {source}")]
    ListenFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Tunnel rejected: {code} {message}")]
    Rejected { code: u16, message: String },

    #[error("Tunnel connection closed during handshake")]
    HandshakeClosed,

    #[error("Timed out waiting for CLIENT_TUNNEL_OK")]
    HandshakeTimeout,

    #[error("Payload received before CLIENT_TUNNEL_OK")]
    PayloadBeforeReady,

    #[error("Tunnel cancelled")]
    Cancelled,

    #[error("SOCKS5 error: {0}")]
    Socks(String),
}
