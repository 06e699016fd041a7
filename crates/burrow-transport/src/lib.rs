//! WebSocket transport for the tunnel broker, using tokio-tungstenite
//!
//! # Features
//!
//! - **Encryption**: optional TLS via rustls (`wss://`), PEM files or a
//!   self-signed certificate on the server side
//! - **Ordered delivery**: one writer task per connection, fed by a bounded
//!   queue, so frames go out in the order they were queued and slow peers
//!   push back on senders
//! - **Routing**: the upgrade path picks the handler; unknown paths get 404
//! - **Relay**: a TCP socket <-> WebSocket pump with one-shot teardown

pub mod connection;
pub mod dial;
pub mod error;
pub mod listener;
pub mod relay;
pub mod tls;

pub use connection::{Inbound, PeerHandle, WsConnection, WsReader};
pub use dial::{ClientStream, Dialer};
pub use error::{is_benign_io, is_benign_ws, TransportError, TransportResult};
pub use listener::{accept_routed, bind};
pub use relay::{relay, RelayStats, TeardownGuard};
pub use tls::{ensure_crypto_provider, ClientTlsConfig, ServerTlsConfig};

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// WebSocket limits applied to every connection, in both directions
pub fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(burrow_proto::MAX_FRAME_SIZE);
    config.max_frame_size = Some(burrow_proto::MAX_FRAME_SIZE);
    config
}
