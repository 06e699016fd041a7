//! SOCKS5 listener: no-auth, CONNECT only
//!
//! The CONNECT destination becomes the tunnel target. The success reply is
//! written only after the broker's `CLIENT_TUNNEL_OK`, so the SOCKS client
//! never sends payload into a tunnel that is not ready.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socksv5::v5::{SocksV5AuthMethod, SocksV5Command, SocksV5Host, SocksV5RequestStatus};
use socksv5::SocksVersion;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::TunnelConnector;
use crate::error::ClientError;

pub async fn run_socks5(
    listener: TcpListener,
    connector: Arc<TunnelConnector>,
    shutdown: CancellationToken,
) {
    let local_addr = listener.local_addr().ok();
    info!(listen = ?local_addr, "SOCKS5 listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                let connector = connector.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_socks5(socket, peer_addr, &connector).await {
                        warn!(peer = %peer_addr, error = %e, "SOCKS5 session failed");
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept SOCKS5 connection: {}", e);
            }
        }
    }

    info!(listen = ?local_addr, "SOCKS5 listener stopped");
}

fn socks_err(e: impl std::fmt::Display) -> ClientError {
    ClientError::Socks(e.to_string())
}

async fn handle_socks5(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    connector: &TunnelConnector,
) -> Result<(), ClientError> {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    match socksv5::read_version(&mut socket).await.map_err(socks_err)? {
        SocksVersion::V5 => {}
        SocksVersion::V4 => return Err(ClientError::Socks("SOCKS4 is not supported".into())),
    }

    let handshake = socksv5::v5::read_handshake_skip_version(&mut socket)
        .await
        .map_err(socks_err)?;
    if !handshake
        .methods
        .iter()
        .any(|method| matches!(method, SocksV5AuthMethod::Noauth))
    {
        socksv5::v5::write_auth_method(&mut socket, SocksV5AuthMethod::NoAcceptableMethod)
            .await
            .map_err(socks_err)?;
        return Err(ClientError::Socks("no acceptable auth method".into()));
    }
    socksv5::v5::write_auth_method(&mut socket, SocksV5AuthMethod::Noauth)
        .await
        .map_err(socks_err)?;

    let request = socksv5::v5::read_request(&mut socket)
        .await
        .map_err(socks_err)?;
    if !matches!(request.command, SocksV5Command::Connect) {
        reply(&mut socket, SocksV5RequestStatus::CommandNotSupported).await?;
        return Err(ClientError::Socks("only CONNECT is supported".into()));
    }

    let target_host = host_to_string(&request.host);
    let target_port = request.port;
    debug!(peer = %peer_addr, target = %format!("{}:{}", target_host, target_port), "SOCKS5 CONNECT");

    let tunnel = match connector.open(&target_host, target_port).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let _ = reply(&mut socket, SocksV5RequestStatus::HostUnreachable).await;
            return Err(e);
        }
    };

    if let Err(e) = reply(&mut socket, SocksV5RequestStatus::Success).await {
        tunnel.context.close("socks5 reply failed");
        return Err(e);
    }

    info!(
        tunnel_id = %tunnel.context.tunnel_id,
        peer = %peer_addr,
        target = %format!("{}:{}", target_host, target_port),
        "SOCKS5 tunnel established"
    );
    connector.relay(tunnel, socket).await;
    Ok(())
}

async fn reply(socket: &mut TcpStream, status: SocksV5RequestStatus) -> Result<(), ClientError> {
    socksv5::v5::write_request_status(socket, status, SocksV5Host::Ipv4([0, 0, 0, 0]), 0)
        .await
        .map_err(socks_err)
}

fn host_to_string(host: &SocksV5Host) -> String {
    match host {
        SocksV5Host::Ipv4(ip) => Ipv4Addr::from(*ip).to_string(),
        SocksV5Host::Ipv6(ip) => Ipv6Addr::from(*ip).to_string(),
        SocksV5Host::Domain(name) => String::from_utf8_lossy(name).to_string(),
    }
}
