//! JSON codec for control messages

use thiserror::Error;

use crate::messages::{ControlMessage, MessageKind};

/// Errors produced while decoding a control frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("control frame is not a JSON object")]
    NotAnObject,

    #[error("missing message type")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {field} longer than {max_len} bytes")]
    FieldTooLong { field: &'static str, max_len: usize },

    #[error("invalid tunnel id: {0}")]
    InvalidTunnelId(String),

    #[error("invalid port in {0}")]
    InvalidPort(&'static str),

    #[error("encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Unknown types are tolerated once a connection has passed its handshake
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, ProtocolError::UnknownType(_))
    }
}

/// Decode a text frame into a validated control message
pub fn decode(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let type_name = object
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ProtocolError::MissingType)?;

    let kind = MessageKind::from_type(type_name)
        .ok_or_else(|| ProtocolError::UnknownType(type_name.to_string()))?;

    let message: ControlMessage =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })?;

    message.validate()
}

/// Encode a control message as the JSON text of a frame
pub fn encode(message: &ControlMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}
