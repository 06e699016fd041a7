//! Plain port-forward listeners

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwardRule;
use crate::connector::TunnelConnector;

/// Accept local connections and tunnel each one to the rule's target
pub async fn run_forward(
    listener: TcpListener,
    rule: ForwardRule,
    connector: Arc<TunnelConnector>,
    shutdown: CancellationToken,
) {
    let rule = Arc::new(rule);
    info!(forward = %rule, "Forward listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!(peer = %peer_addr, forward = %rule, "Accepted local connection");
                let connector = connector.clone();
                let rule = rule.clone();
                tokio::spawn(async move {
                    handle_forward(socket, peer_addr, &rule, &connector).await;
                });
            }
            Err(e) => {
                error!("Failed to accept local connection: {}", e);
            }
        }
    }

    info!(forward = %rule, "Forward listener stopped");
}

async fn handle_forward(
    socket: TcpStream,
    peer_addr: SocketAddr,
    rule: &ForwardRule,
    connector: &TunnelConnector,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    match connector.open(&rule.target_host, rule.target_port).await {
        Ok(tunnel) => {
            connector.relay(tunnel, socket).await;
        }
        Err(e) => {
            // Dropping the socket is the only signal the local peer gets
            warn!(peer = %peer_addr, forward = %rule, error = %e, "Tunnel open failed");
        }
    }
}
