//! Stable rejection codes carried by the `*_ERR` control messages

use thiserror::Error;

/// Why a handshake was refused
///
/// Numeric codes are HTTP-status inspired and never change; the reason
/// string is what goes into the `message` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectCode {
    #[error("BAD_TOKEN")]
    BadToken,

    #[error("AGENT_MISMATCH")]
    AgentMismatch,

    #[error("AGENT_OFFLINE")]
    AgentOffline,

    #[error("NO_SUCH_TUNNEL")]
    NoSuchTunnel,

    #[error("DUPLICATE_TUNNEL_ID")]
    DuplicateTunnelId,

    #[error("DIAL_FAILED")]
    DialFailed,

    #[error("DATA_WS_FAILED")]
    DataConnectFailed,

    #[error("HANDSHAKE_TIMEOUT")]
    HandshakeTimeout,
}

impl RejectCode {
    /// Numeric code sent in the `code` field
    pub fn code(&self) -> u16 {
        match self {
            RejectCode::BadToken => 401,
            RejectCode::AgentMismatch => 403,
            RejectCode::AgentOffline | RejectCode::NoSuchTunnel => 404,
            RejectCode::DuplicateTunnelId => 409,
            RejectCode::DialFailed | RejectCode::DataConnectFailed => 502,
            RejectCode::HandshakeTimeout => 504,
        }
    }

    /// Reason string sent in the `message` field
    pub fn reason(&self) -> &'static str {
        match self {
            RejectCode::BadToken => "BAD_TOKEN",
            RejectCode::AgentMismatch => "AGENT_MISMATCH",
            RejectCode::AgentOffline => "AGENT_OFFLINE",
            RejectCode::NoSuchTunnel => "NO_SUCH_TUNNEL",
            RejectCode::DuplicateTunnelId => "DUPLICATE_TUNNEL_ID",
            RejectCode::DialFailed => "DIAL_FAILED",
            RejectCode::DataConnectFailed => "DATA_WS_FAILED",
            RejectCode::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
        }
    }
}
