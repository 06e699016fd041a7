//! Server side of the tunnel broker
//!
//! - [`AgentRegistry`]: agent id -> live control connection
//! - [`TunnelRegistry`]: pending/active tunnel state machine
//! - [`session`]: handshake state machines for the three upgrade paths
//! - [`TunnelServer`]: TCP/TLS accept loop and upgrade routing

pub mod agent_registry;
pub mod server;
pub mod session;
pub mod tunnel_registry;

pub use agent_registry::{AgentRecord, AgentRegistry};
pub use server::{
    ServerConfig, TunnelServer, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PENDING_TIMEOUT,
};
pub use session::Route;
pub use tunnel_registry::{ActiveTunnel, BindRequest, OpenRequest, PendingTunnel, TunnelRegistry};
