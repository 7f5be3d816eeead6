//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Dials the destination, answers the client with `200`, takes over the
//! client's raw connection and relays bytes in both directions until either
//! side finishes.

use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn, Instrument};

use crate::error::{Result, TollgateError};
use crate::lifecycle::DrainGuard;
use crate::proxy::body::{self, ProxyBody};

/// How a tunnel came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// The client→destination copy finished first
    ClientClosed { bytes: u64 },
    /// The destination→client copy finished first
    DestinationClosed { bytes: u64 },
    /// The listener's drain deadline expired
    Terminated,
}

/// Handles CONNECT tunnel requests
pub struct TunnelHandler;

impl TunnelHandler {
    /// Serve one CONNECT request.
    ///
    /// Never returns `200` unless the destination is connected and the
    /// connection can be taken over.
    pub async fn handle<B>(mut req: Request<B>, guard: DrainGuard) -> Response<ProxyBody> {
        let target = match connect_target(&req) {
            Ok(target) => target,
            Err(e) => return e.to_response(),
        };

        let server = match Self::dial(&target).await {
            Ok(server) => server,
            Err(e) => {
                warn!(error = %e, "CONNECT dial failed");
                return e.to_response();
            }
        };

        let on_upgrade = match take_upgrade(&mut req) {
            Ok(on_upgrade) => on_upgrade,
            Err(e) => {
                warn!("CONNECT connection cannot be taken over");
                return e.to_response();
            }
        };

        // The relay outlives this request; keep it in the connection span
        tokio::spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let end = Self::relay_upgraded(upgraded, server, guard).await;
                        debug!(%target, ?end, "Tunnel closed");
                    }
                    Err(e) => {
                        debug!(%target, "CONNECT upgrade failed: {}", e);
                    }
                }
            }
            .in_current_span(),
        );

        let mut response = Response::new(body::empty());
        *response.status_mut() = StatusCode::OK;
        response
    }

    /// Establish a direct TCP connection to the target
    #[instrument]
    pub async fn dial(target: &str) -> Result<TcpStream> {
        debug!("Dialing tunnel destination {}", target);

        TcpStream::connect(target)
            .await
            .map_err(|e| TollgateError::DestinationUnreachable(format!("dial tcp {}: {}", target, e)))
    }

    async fn relay_upgraded(upgraded: Upgraded, server: TcpStream, guard: DrainGuard) -> TunnelEnd {
        // Wrap Upgraded with TokioIo to get tokio AsyncRead/AsyncWrite traits
        let client = TokioIo::new(upgraded);
        Self::relay(client, server, guard).await
    }

    /// Relay bytes between two streams until the first direction finishes.
    ///
    /// Each direction runs as its own task. Whichever completes first ends the
    /// tunnel: the other task is aborted and awaited so that both streams are
    /// dropped before this returns.
    pub async fn relay<C, S>(client: C, server: S, mut guard: DrainGuard) -> TunnelEnd
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let mut client_to_server = tokio::spawn(async move {
            let result = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            result
        });

        let mut server_to_client = tokio::spawn(async move {
            let result = tokio::io::copy(&mut server_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        });

        tokio::select! {
            result = &mut client_to_server => {
                server_to_client.abort();
                let _ = server_to_client.await;
                TunnelEnd::ClientClosed { bytes: copied(result, "client to destination") }
            }
            result = &mut server_to_client => {
                client_to_server.abort();
                let _ = client_to_server.await;
                TunnelEnd::DestinationClosed { bytes: copied(result, "destination to client") }
            }
            _ = guard.terminated() => {
                client_to_server.abort();
                server_to_client.abort();
                let _ = client_to_server.await;
                let _ = server_to_client.await;
                TunnelEnd::Terminated
            }
        }
    }
}

fn copied(
    result: std::result::Result<std::io::Result<u64>, tokio::task::JoinError>,
    direction: &str,
) -> u64 {
    match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            debug!("Tunnel copy {} ended: {}", direction, e);
            0
        }
        Err(e) => {
            debug!("Tunnel copy {} task failed: {}", direction, e);
            0
        }
    }
}

/// `host:port` named by a CONNECT request
fn connect_target<B>(req: &Request<B>) -> Result<String> {
    if let Some(authority) = req.uri().authority() {
        if authority.port_u16().is_some() {
            return Ok(authority.to_string());
        }
    }

    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TollgateError::InvalidTarget(req.uri().to_string()))
}

/// Acquire the right to take over the client connection.
///
/// The listener only attaches an upgrade handle to connections it can hand
/// over; its absence is reported as [`TollgateError::UpgradeUnsupported`].
pub fn take_upgrade<B>(req: &mut Request<B>) -> Result<OnUpgrade> {
    req.extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(TollgateError::UpgradeUnsupported)
}
