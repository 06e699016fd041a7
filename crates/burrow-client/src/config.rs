//! Client configuration and listener rule parsing

use std::fmt;
use std::str::FromStr;

use burrow_transport::ClientTlsConfig;

use crate::error::ClientError;

/// Listen host used when a rule omits it
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// `[LISTEN_HOST:]LISTEN_PORT:TARGET_HOST:TARGET_PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub listen_host: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardRule {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

impl FromStr for ForwardRule {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidForward(value.to_string());

        let parts: Vec<&str> = value.split(':').collect();
        let (listen_host, listen_port, target_host, target_port) = match parts.as_slice() {
            [lport, host, port] => (DEFAULT_LISTEN_HOST, *lport, *host, *port),
            [lhost, lport, host, port] => (*lhost, *lport, *host, *port),
            _ => return Err(invalid()),
        };

        if listen_host.is_empty()
            || target_host.is_empty()
            || target_host.len() > burrow_proto::MAX_TARGET_HOST_LEN
        {
            return Err(invalid());
        }

        Ok(Self {
            listen_host: listen_host.to_string(),
            listen_port: parse_port(listen_port, true).ok_or_else(invalid)?,
            target_host: target_host.to_string(),
            target_port: parse_port(target_port, false).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.listen_host, self.listen_port, self.target_host, self.target_port
        )
    }
}

/// `[HOST:]PORT` for a SOCKS5 listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Listen {
    pub listen_host: String,
    pub listen_port: u16,
}

impl Socks5Listen {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

impl FromStr for Socks5Listen {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidSocks5(value.to_string());

        let parts: Vec<&str> = value.split(':').collect();
        let (listen_host, listen_port) = match parts.as_slice() {
            [port] => (DEFAULT_LISTEN_HOST, *port),
            [host, port] if !host.is_empty() => (*host, *port),
            _ => return Err(invalid()),
        };

        Ok(Self {
            listen_host: listen_host.to_string(),
            listen_port: parse_port(listen_port, true).ok_or_else(invalid)?,
        })
    }
}

/// Listen ports may be 0 (ephemeral), target ports may not
fn parse_port(value: &str, allow_zero: bool) -> Option<u16> {
    let port: u16 = value.trim().parse().ok()?;
    if port == 0 && !allow_zero {
        return None;
    }
    Some(port)
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker base URL (`ws://` or `wss://`)
    pub server_url: String,

    /// Shared secret
    pub token: String,

    /// Agent every tunnel is routed through
    pub agent_id: String,

    pub tls: ClientTlsConfig,

    pub forwards: Vec<ForwardRule>,

    pub socks5: Vec<Socks5Listen>,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            agent_id: agent_id.into(),
            tls: ClientTlsConfig::default(),
            forwards: Vec::new(),
            socks5: Vec::new(),
        }
    }

    pub fn with_forward(mut self, rule: ForwardRule) -> Self {
        self.forwards.push(rule);
        self
    }

    pub fn with_socks5(mut self, listen: Socks5Listen) -> Self {
        self.socks5.push(listen);
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.agent_id.is_empty() || self.agent_id.len() > burrow_proto::MAX_AGENT_ID_LEN {
            return Err(ClientError::InvalidConfig(format!(
                "agent id must be 1..={} characters",
                burrow_proto::MAX_AGENT_ID_LEN
            )));
        }
        if self.token.len() > burrow_proto::MAX_TOKEN_LEN {
            return Err(ClientError::InvalidConfig("token is too long".into()));
        }
        if self.forwards.is_empty() && self.socks5.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one --forward or --socks5 listener is required".into(),
            ));
        }
        Ok(())
    }
}
