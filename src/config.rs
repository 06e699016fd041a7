//! YAML config files and merging them with command-line flags
//!
//! Every role accepts `--config <file.yaml>`. Values given on the command
//! line (or through `BURROW_*` variables) win over the file; anything left
//! unset falls back to the built-in defaults.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_agent::{AgentConfig, DEFAULT_HEARTBEAT_INTERVAL};
use burrow_client::{ClientConfig, ForwardRule, Socks5Listen, DEFAULT_LISTEN_HOST};
use burrow_control::{ServerConfig, DEFAULT_PENDING_TIMEOUT};
use burrow_transport::{ClientTlsConfig, ServerTlsConfig};
use serde::Deserialize;

/// Host used for `--self-signed-tls` without a value
pub const DEFAULT_SELF_SIGNED_HOST: &str = "localhost";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerFile {
    pub bind: Option<String>,
    pub token: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub self_signed_tls: Option<String>,
    pub pending_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentFile {
    pub server: Option<String>,
    pub token: Option<String>,
    pub agent_id: Option<String>,
    pub insecure: Option<bool>,
    pub ca: Option<PathBuf>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientFile {
    pub server: Option<String>,
    pub token: Option<String>,
    pub agent_id: Option<String>,
    pub insecure: Option<bool>,
    pub ca: Option<PathBuf>,
    pub forward: Vec<String>,
    pub socks5: Vec<String>,
}

/// Load a YAML config file, or defaults when no path was given
pub fn load_config_file<T>(path: Option<&Path>) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let Some(path) = path else {
        return Ok(T::default());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Server flags after clap, before merging
#[derive(Debug, Default)]
pub struct ServerOverrides {
    pub bind: Option<String>,
    pub token: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub self_signed_tls: Option<String>,
    pub pending_timeout_secs: Option<u64>,
}

pub fn build_server_config(cli: ServerOverrides, file: ServerFile) -> Result<ServerConfig> {
    let bind = cli
        .bind
        .or(file.bind)
        .context("Missing --bind (or `bind` in the config file)")?;
    let bind_addr = parse_bind_addr(&bind)?;
    let token = require_token(cli.token.or(file.token))?;

    let cert = cli.cert.or(file.cert);
    let key = cli.key.or(file.key);
    let self_signed = cli.self_signed_tls.or(file.self_signed_tls);

    let tls = match (cert, key, self_signed) {
        (Some(_), Some(_), Some(_)) => {
            anyhow::bail!("--self-signed-tls conflicts with --cert/--key")
        }
        (Some(cert_path), Some(key_path), None) => Some(ServerTlsConfig::Pem {
            cert_path,
            key_path,
        }),
        (None, None, Some(host)) => Some(ServerTlsConfig::SelfSigned {
            host: if host.is_empty() {
                DEFAULT_SELF_SIGNED_HOST.to_string()
            } else {
                host
            },
        }),
        (None, None, None) => None,
        _ => anyhow::bail!("--cert and --key must be given together"),
    };

    let pending_timeout = match cli.pending_timeout_secs.or(file.pending_timeout_secs) {
        Some(0) => anyhow::bail!("--pending-timeout-secs must be greater than zero"),
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_PENDING_TIMEOUT,
    };

    let mut config = ServerConfig::new(bind_addr, token);
    config.pending_timeout = pending_timeout;
    config.tls = tls;
    Ok(config)
}

/// Agent flags after clap, before merging
#[derive(Debug, Default)]
pub struct AgentOverrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub agent_id: Option<String>,
    pub insecure: bool,
    pub ca: Option<PathBuf>,
    pub heartbeat_secs: Option<u64>,
}

/// Returns the config and whether the agent id was generated
pub fn build_agent_config(cli: AgentOverrides, file: AgentFile) -> Result<(AgentConfig, bool)> {
    let server = cli
        .server
        .or(file.server)
        .context("Missing --server (or `server` in the config file)")?;
    let token = require_token(cli.token.or(file.token))?;

    let (agent_id, generated) = match cli.agent_id.or(file.agent_id) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    let heartbeat_interval = match cli.heartbeat_secs.or(file.heartbeat_secs) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(DEFAULT_HEARTBEAT_INTERVAL),
    };

    let mut config = AgentConfig::new(agent_id, server, token);
    config.tls = client_tls(cli.insecure || file.insecure.unwrap_or(false), cli.ca.or(file.ca));
    config.heartbeat_interval = heartbeat_interval;
    Ok((config, generated))
}

/// Client flags after clap, before merging
#[derive(Debug, Default)]
pub struct ClientOverrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub agent_id: Option<String>,
    pub insecure: bool,
    pub ca: Option<PathBuf>,
    pub forward: Vec<String>,
    pub socks5: Vec<String>,
}

pub fn build_client_config(cli: ClientOverrides, file: ClientFile) -> Result<ClientConfig> {
    let server = cli
        .server
        .or(file.server)
        .context("Missing --server (or `server` in the config file)")?;
    let token = require_token(cli.token.or(file.token))?;
    let agent_id = cli
        .agent_id
        .or(file.agent_id)
        .context("Missing --agent-id (or `agent_id` in the config file)")?;

    let forwards = if cli.forward.is_empty() { file.forward } else { cli.forward };
    let socks5 = if cli.socks5.is_empty() { file.socks5 } else { cli.socks5 };

    let mut config = ClientConfig::new(server, token, agent_id).with_tls(client_tls(
        cli.insecure || file.insecure.unwrap_or(false),
        cli.ca.or(file.ca),
    ));
    for rule in forwards {
        let rule: ForwardRule = rule.parse().context("Bad --forward rule")?;
        config = config.with_forward(rule);
    }
    for listen in socks5 {
        let listen: Socks5Listen = listen.parse().context("Bad --socks5 listen address")?;
        config = config.with_socks5(listen);
    }

    config.validate()?;
    Ok(config)
}

fn client_tls(insecure: bool, ca_cert_path: Option<PathBuf>) -> ClientTlsConfig {
    ClientTlsConfig {
        insecure,
        ca_cert_path,
    }
}

fn require_token(token: Option<String>) -> Result<String> {
    let token = token.context("Missing --token (or `token` in the config file)")?;
    if token.is_empty() || token.len() > burrow_proto::MAX_TOKEN_LEN {
        anyhow::bail!(
            "Token must be 1..={} characters",
            burrow_proto::MAX_TOKEN_LEN
        );
    }
    Ok(token)
}

/// `[HOST:]PORT`, host defaulting to all interfaces
pub fn parse_bind_addr(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (DEFAULT_LISTEN_HOST, value),
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in bind address '{}'", value))?;
    if host.is_empty() {
        anyhow::bail!("Invalid bind address '{}' (expected [HOST:]PORT)", value);
    }

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve bind address '{}'", value))?
        .next()
        .with_context(|| format!("Cannot resolve bind address '{}'", value))
}
