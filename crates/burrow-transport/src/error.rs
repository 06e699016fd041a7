//! Transport errors and IO-noise classification

use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tungstenite::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] burrow_proto::ProtocolError),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Peer-initiated disconnects that should be logged quietly
    pub fn is_benign(&self) -> bool {
        match self {
            TransportError::StreamClosed => true,
            TransportError::IoError(e) => is_benign_io(e),
            TransportError::WebSocketError(e) => is_benign_ws(e),
            _ => false,
        }
    }
}

/// Resets, broken pipes and timeouts are routine when peers go away
pub fn is_benign_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

pub fn is_benign_ws(err: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError as WsProtocolError;

    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(e) => is_benign_io(e),
        _ => false,
    }
}
