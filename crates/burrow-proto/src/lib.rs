//! Burrow Protocol Definitions
//!
//! This crate defines the control-plane message catalogue exchanged between
//! the broker server, agents and clients, together with the JSON codec, the
//! field constraints every handshake message must satisfy and the stable
//! rejection codes.
//!
//! Control messages travel as WebSocket text frames holding a single JSON
//! object with a `type` discriminator. Payload bytes travel as binary frames
//! with no envelope at all.

pub mod codec;
pub mod messages;
pub mod reject;

pub use codec::{decode, encode, ProtocolError};
pub use messages::{ControlMessage, MessageKind};
pub use reject::RejectCode;

/// Upgrade path for the agent control plane
pub const AGENT_CONTROL_PATH: &str = "/ws/agent/control";

/// Upgrade path for agent data connections (one per tunnel)
pub const AGENT_DATA_PATH: &str = "/ws/agent/data";

/// Upgrade path for client tunnel connections (one per tunnel)
pub const CLIENT_TUNNEL_PATH: &str = "/ws/client/tunnel";

/// Maximum WebSocket frame payload accepted on any connection (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Field length limits
pub const MAX_TUNNEL_ID_LEN: usize = 64;
pub const MAX_AGENT_ID_LEN: usize = 128;
pub const MAX_TARGET_HOST_LEN: usize = 255;
pub const MAX_TOKEN_LEN: usize = 256;
