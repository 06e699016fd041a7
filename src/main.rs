//! Burrow CLI - reverse TCP tunnels over WebSocket
//!
//! One binary, three roles: `burrow server` brokers tunnels, `burrow agent`
//! runs inside the private network and dials targets, `burrow client`
//! exposes local listeners that reach those targets through an agent.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use burrow_agent::Agent;
use burrow_client::Client;
use burrow_control::TunnelServer;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{
    build_agent_config, build_client_config, build_server_config, load_config_file,
    AgentOverrides, ClientOverrides, ServerOverrides, DEFAULT_SELF_SIGNED_HOST,
};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Burrow - reach private TCP services through a public broker
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version = VERSION)]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public broker
    #[command(long_about = r#"
Run the broker that agents register with and clients open tunnels through.

EXAMPLES:
  burrow server --bind 0.0.0.0:8080 --token $BURROW_TOKEN
  burrow server --bind 443 --token $BURROW_TOKEN --cert cert.pem --key key.pem
  burrow server --bind 8443 --token $BURROW_TOKEN --self-signed-tls tunnel.example.com
    "#)]
    Server(ServerArgs),

    /// Run an agent inside the private network
    #[command(long_about = r#"
Register with a broker and dial targets on behalf of clients.

EXAMPLES:
  burrow agent --server wss://tunnel.example.com --token $BURROW_TOKEN --agent-id office
    "#)]
    Agent(AgentArgs),

    /// Expose local listeners that tunnel through an agent
    #[command(long_about = r#"
Bind local listeners; every accepted connection becomes a tunnel to the agent.

EXAMPLES:
  burrow client --server wss://tunnel.example.com --token $BURROW_TOKEN \
    --agent-id office --forward 15432:db.internal:5432
  burrow client --server ws://127.0.0.1:8080 --token $BURROW_TOKEN \
    --agent-id office --socks5 127.0.0.1:1080
    "#)]
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// YAML config file
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, [HOST:]PORT
    #[arg(long, env = "BURROW_BIND")]
    bind: Option<String>,

    /// Shared secret for agents and clients
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long, env = "BURROW_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "BURROW_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// Serve wss:// with a generated self-signed certificate for HOST
    #[arg(
        long,
        env = "BURROW_SELF_SIGNED_TLS",
        value_name = "HOST",
        num_args = 0..=1,
        default_missing_value = DEFAULT_SELF_SIGNED_HOST,
        conflicts_with_all = ["cert", "key"]
    )]
    self_signed_tls: Option<String>,

    /// Seconds a tunnel may wait for its agent to bind
    #[arg(long, env = "BURROW_PENDING_TIMEOUT_SECS")]
    pending_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// YAML config file
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL (ws://HOST:PORT or wss://HOST:PORT)
    #[arg(long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// Shared secret
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Agent ID (random UUID if not given)
    #[arg(long, env = "BURROW_AGENT_ID")]
    agent_id: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long, env = "BURROW_INSECURE")]
    insecure: bool,

    /// Trust this CA certificate (PEM) instead of the web roots
    #[arg(long, env = "BURROW_CA")]
    ca: Option<PathBuf>,

    /// Heartbeat period in seconds, 0 disables
    #[arg(long, env = "BURROW_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// YAML config file
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL (ws://HOST:PORT or wss://HOST:PORT)
    #[arg(long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// Shared secret
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Agent to route tunnels through
    #[arg(long, env = "BURROW_AGENT_ID")]
    agent_id: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long, env = "BURROW_INSECURE")]
    insecure: bool,

    /// Trust this CA certificate (PEM) instead of the web roots
    #[arg(long, env = "BURROW_CA")]
    ca: Option<PathBuf>,

    /// [LISTEN_HOST:]LISTEN_PORT:TARGET_HOST:TARGET_PORT (repeatable)
    #[arg(long = "forward", env = "BURROW_FORWARD", value_delimiter = ',')]
    forward: Vec<String>,

    /// SOCKS5 listener, [HOST:]PORT (repeatable)
    #[arg(long = "socks5", env = "BURROW_SOCKS5", value_delimiter = ',')]
    socks5: Vec<String>,
}

/// RUST_LOG wins when set, otherwise `--log-level`
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
    shutdown
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let file = load_config_file(args.config.as_deref())?;
    let config = build_server_config(
        ServerOverrides {
            bind: args.bind,
            token: args.token,
            cert: args.cert,
            key: args.key,
            self_signed_tls: args.self_signed_tls,
            pending_timeout_secs: args.pending_timeout_secs,
        },
        file,
    )?;

    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start tunnel server")?;

    let shutdown = shutdown_on_ctrl_c();
    server.run(shutdown).await;
    info!("Burrow server stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let file = load_config_file(args.config.as_deref())?;
    let (config, generated_id) = build_agent_config(
        AgentOverrides {
            server: args.server,
            token: args.token,
            agent_id: args.agent_id,
            insecure: args.insecure,
            ca: args.ca,
            heartbeat_secs: args.heartbeat_secs,
        },
        file,
    )?;

    if generated_id {
        // Clients need this id, so it goes to stdout as well as the log
        println!("Agent ID: {}", config.agent_id);
        info!(agent_id = %config.agent_id, "Generated agent ID");
    }
    if config.tls.insecure {
        warn!("Certificate verification disabled (insecure mode)");
    }

    let agent = Agent::new(config).context("Failed to create agent")?;
    let shutdown = shutdown_on_ctrl_c();
    agent.run(shutdown).await.context("Agent stopped")?;
    info!("Burrow agent stopped");
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let file = load_config_file(args.config.as_deref())?;
    let config = build_client_config(
        ClientOverrides {
            server: args.server,
            token: args.token,
            agent_id: args.agent_id,
            insecure: args.insecure,
            ca: args.ca,
            forward: args.forward,
            socks5: args.socks5,
        },
        file,
    )?;

    for rule in &config.forwards {
        info!(forward = %rule, "Forward configured");
    }
    if config.tls.insecure {
        warn!("Certificate verification disabled (insecure mode)");
    }

    let client = Client::bind(config)
        .await
        .context("Failed to start client listeners")?;
    let shutdown = shutdown_on_ctrl_c();
    client.run(shutdown).await;
    info!("Burrow client stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    info!(version = VERSION, "Burrow starting");

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Client(args) => run_client(args).await,
    }
}
