//! Server-side WebSocket upgrade with path routing

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info};

use crate::connection::WsConnection;
use crate::error::{TransportError, TransportResult};
use crate::ws_config;

/// Bind a TCP listener, reporting the address in the error on failure
pub async fn bind(bind_addr: SocketAddr) -> TransportResult<TcpListener> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TransportError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: e.to_string(),
        })?;

    let local_addr = listener.local_addr()?;
    info!("Listener bound to {}", local_addr);
    Ok(listener)
}

/// Complete the upgrade handshake, choosing a route from the request path
///
/// `resolve` maps the request path (query string stripped) to a route; an
/// unknown path is answered with HTTP 404 and no WebSocket is established.
pub async fn accept_routed<S, R, F>(
    stream: S,
    remote_addr: SocketAddr,
    resolve: F,
) -> TransportResult<(WsConnection<S>, R)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(&str) -> Option<R>,
{
    let mut route = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        match resolve(path) {
            Some(r) => {
                route = Some(r);
                Ok(response)
            }
            None => {
                debug!("Rejecting upgrade for unknown path {} from {}", path, remote_addr);
                let mut response = ErrorResponse::new(None);
                *response.status_mut() = StatusCode::NOT_FOUND;
                Err(response)
            }
        }
    };

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config()))
            .await?;

    let route = route.ok_or_else(|| {
        TransportError::ConnectionError("Upgrade completed without a route".to_string())
    })?;

    Ok((WsConnection::new(ws_stream, remote_addr), route))
}
