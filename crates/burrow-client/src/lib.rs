//! Burrow client
//!
//! Binds local listeners (plain forwards and SOCKS5) and turns every accepted
//! connection into its own tunnel through the broker to a chosen agent.

pub mod client;
pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod forward;
pub mod socks5;

pub use client::Client;
pub use config::{ClientConfig, ForwardRule, Socks5Listen, DEFAULT_LISTEN_HOST};
pub use connector::{OpenTunnel, TunnelConnector};
pub use context::ClientTunnelContext;
pub use error::ClientError;
