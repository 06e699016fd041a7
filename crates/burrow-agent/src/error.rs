use burrow_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registration rejected: {code} {message}")]
    RegistrationRejected { code: u16, message: String },

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Control connection closed")]
    ControlClosed,

    #[error("Failed to connect to target {address}: {source}")]
    DialFailed {
        address: String,
        source: std::io::Error,
    },
}
