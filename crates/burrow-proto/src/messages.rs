//! Protocol message types

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::reject::RejectCode;
use crate::{MAX_AGENT_ID_LEN, MAX_TARGET_HOST_LEN, MAX_TOKEN_LEN, MAX_TUNNEL_ID_LEN};

/// Control-plane message carried in a WebSocket text frame
///
/// Serialized as one JSON object, e.g.
/// `{"type":"TUNNEL_CREATE","tunnelId":"...","targetHost":"db","targetPort":5432}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    // Agent control plane (/ws/agent/control)
    /// Agent authenticates and claims an agent id
    AgentRegister { agent_id: String, token: String },
    /// Server accepted the registration
    AgentRegisterOk,
    /// Server refused the registration
    AgentRegisterErr { code: u16, message: String },
    /// Agent liveness signal, refreshes `lastSeenAt`
    AgentHeartbeat,
    /// Server asks the agent to dial a target for a pending tunnel
    TunnelCreate {
        tunnel_id: String,
        target_host: String,
        target_port: u16,
    },
    /// Agent could not set up the tunnel it was asked for
    TunnelCreateErr {
        tunnel_id: String,
        #[serde(default = "default_create_err_code")]
        code: u16,
        #[serde(default)]
        message: String,
    },

    // Client data plane (/ws/client/tunnel)
    ClientTunnelOpen {
        tunnel_id: String,
        agent_id: String,
        target_host: String,
        target_port: u16,
        token: String,
    },
    ClientTunnelOk { tunnel_id: String },
    ClientTunnelErr {
        tunnel_id: String,
        code: u16,
        message: String,
    },

    // Agent data plane (/ws/agent/data)
    AgentDataBind {
        tunnel_id: String,
        agent_id: String,
        token: String,
    },
    AgentDataBindOk { tunnel_id: String },
    AgentDataBindErr {
        tunnel_id: String,
        code: u16,
        message: String,
    },
}

fn default_create_err_code() -> u16 {
    RejectCode::DialFailed.code()
}

/// The `type` discriminator of every known control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AgentRegister,
    AgentRegisterOk,
    AgentRegisterErr,
    AgentHeartbeat,
    TunnelCreate,
    TunnelCreateErr,
    ClientTunnelOpen,
    ClientTunnelOk,
    ClientTunnelErr,
    AgentDataBind,
    AgentDataBindOk,
    AgentDataBindErr,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::AgentRegister,
        MessageKind::AgentRegisterOk,
        MessageKind::AgentRegisterErr,
        MessageKind::AgentHeartbeat,
        MessageKind::TunnelCreate,
        MessageKind::TunnelCreateErr,
        MessageKind::ClientTunnelOpen,
        MessageKind::ClientTunnelOk,
        MessageKind::ClientTunnelErr,
        MessageKind::AgentDataBind,
        MessageKind::AgentDataBindOk,
        MessageKind::AgentDataBindErr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::AgentRegister => "AGENT_REGISTER",
            MessageKind::AgentRegisterOk => "AGENT_REGISTER_OK",
            MessageKind::AgentRegisterErr => "AGENT_REGISTER_ERR",
            MessageKind::AgentHeartbeat => "AGENT_HEARTBEAT",
            MessageKind::TunnelCreate => "TUNNEL_CREATE",
            MessageKind::TunnelCreateErr => "TUNNEL_CREATE_ERR",
            MessageKind::ClientTunnelOpen => "CLIENT_TUNNEL_OPEN",
            MessageKind::ClientTunnelOk => "CLIENT_TUNNEL_OK",
            MessageKind::ClientTunnelErr => "CLIENT_TUNNEL_ERR",
            MessageKind::AgentDataBind => "AGENT_DATA_BIND",
            MessageKind::AgentDataBindOk => "AGENT_DATA_BIND_OK",
            MessageKind::AgentDataBindErr => "AGENT_DATA_BIND_ERR",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::AgentRegister { .. } => MessageKind::AgentRegister,
            ControlMessage::AgentRegisterOk => MessageKind::AgentRegisterOk,
            ControlMessage::AgentRegisterErr { .. } => MessageKind::AgentRegisterErr,
            ControlMessage::AgentHeartbeat => MessageKind::AgentHeartbeat,
            ControlMessage::TunnelCreate { .. } => MessageKind::TunnelCreate,
            ControlMessage::TunnelCreateErr { .. } => MessageKind::TunnelCreateErr,
            ControlMessage::ClientTunnelOpen { .. } => MessageKind::ClientTunnelOpen,
            ControlMessage::ClientTunnelOk { .. } => MessageKind::ClientTunnelOk,
            ControlMessage::ClientTunnelErr { .. } => MessageKind::ClientTunnelErr,
            ControlMessage::AgentDataBind { .. } => MessageKind::AgentDataBind,
            ControlMessage::AgentDataBindOk { .. } => MessageKind::AgentDataBindOk,
            ControlMessage::AgentDataBindErr { .. } => MessageKind::AgentDataBindErr,
        }
    }

    /// Tunnel id the message refers to, if any
    pub fn tunnel_id(&self) -> Option<&str> {
        match self {
            ControlMessage::TunnelCreate { tunnel_id, .. }
            | ControlMessage::TunnelCreateErr { tunnel_id, .. }
            | ControlMessage::ClientTunnelOpen { tunnel_id, .. }
            | ControlMessage::ClientTunnelOk { tunnel_id }
            | ControlMessage::ClientTunnelErr { tunnel_id, .. }
            | ControlMessage::AgentDataBind { tunnel_id, .. }
            | ControlMessage::AgentDataBindOk { tunnel_id }
            | ControlMessage::AgentDataBindErr { tunnel_id, .. } => Some(tunnel_id),
            _ => None,
        }
    }

    pub fn register_err(reject: RejectCode) -> Self {
        ControlMessage::AgentRegisterErr {
            code: reject.code(),
            message: reject.reason().to_string(),
        }
    }

    pub fn create_err(tunnel_id: impl Into<String>, reject: RejectCode) -> Self {
        ControlMessage::TunnelCreateErr {
            tunnel_id: tunnel_id.into(),
            code: reject.code(),
            message: reject.reason().to_string(),
        }
    }

    pub fn client_err(tunnel_id: impl Into<String>, reject: RejectCode) -> Self {
        ControlMessage::ClientTunnelErr {
            tunnel_id: tunnel_id.into(),
            code: reject.code(),
            message: reject.reason().to_string(),
        }
    }

    pub fn bind_err(tunnel_id: impl Into<String>, reject: RejectCode) -> Self {
        ControlMessage::AgentDataBindErr {
            tunnel_id: tunnel_id.into(),
            code: reject.code(),
            message: reject.reason().to_string(),
        }
    }

    /// Enforce the field constraints of the message
    ///
    /// `TUNNEL_CREATE_ERR` with a blank `message` is normalized to the
    /// dial-failed reason rather than rejected.
    pub fn validate(mut self) -> Result<Self, ProtocolError> {
        match &mut self {
            ControlMessage::AgentRegister { agent_id, token } => {
                require_text("agentId", agent_id, MAX_AGENT_ID_LEN)?;
                require_text("token", token, MAX_TOKEN_LEN)?;
            }
            ControlMessage::TunnelCreate {
                tunnel_id,
                target_host,
                target_port,
            } => {
                require_tunnel_id(tunnel_id)?;
                require_text("targetHost", target_host, MAX_TARGET_HOST_LEN)?;
                require_port("targetPort", *target_port)?;
            }
            ControlMessage::TunnelCreateErr {
                tunnel_id, message, ..
            } => {
                require_tunnel_id(tunnel_id)?;
                if message.trim().is_empty() {
                    *message = RejectCode::DialFailed.reason().to_string();
                }
            }
            ControlMessage::ClientTunnelOpen {
                tunnel_id,
                agent_id,
                target_host,
                target_port,
                token,
            } => {
                require_tunnel_id(tunnel_id)?;
                require_text("agentId", agent_id, MAX_AGENT_ID_LEN)?;
                require_text("targetHost", target_host, MAX_TARGET_HOST_LEN)?;
                require_port("targetPort", *target_port)?;
                require_text("token", token, MAX_TOKEN_LEN)?;
            }
            ControlMessage::AgentDataBind {
                tunnel_id,
                agent_id,
                token,
            } => {
                require_tunnel_id(tunnel_id)?;
                require_text("agentId", agent_id, MAX_AGENT_ID_LEN)?;
                require_text("token", token, MAX_TOKEN_LEN)?;
            }
            _ => {}
        }
        Ok(self)
    }
}

fn require_text(field: &'static str, value: &str, max_len: usize) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    if value.len() > max_len {
        return Err(ProtocolError::FieldTooLong { field, max_len });
    }
    Ok(())
}

fn require_tunnel_id(value: &str) -> Result<(), ProtocolError> {
    require_text("tunnelId", value, MAX_TUNNEL_ID_LEN)?;
    uuid::Uuid::parse_str(value).map_err(|_| ProtocolError::InvalidTunnelId(value.to_string()))?;
    Ok(())
}

fn require_port(field: &'static str, port: u16) -> Result<(), ProtocolError> {
    if port == 0 {
        return Err(ProtocolError::InvalidPort(field));
    }
    Ok(())
}
