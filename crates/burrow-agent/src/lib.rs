//! Burrow agent
//!
//! Runs next to the services being exposed. It keeps one control
//! connection registered with the broker and, for every `TUNNEL_CREATE`,
//! dials the requested target and binds a fresh data connection to it.

pub mod agent;
pub mod error;
pub mod tunnel;

pub use agent::{Agent, AgentConfig, DEFAULT_HEARTBEAT_INTERVAL};
pub use error::AgentError;
pub use tunnel::{TunnelContext, TunnelManager};
