//! Proxy server implementation using hyper
//!
//! Accepts client connections and serves every request through the
//! [`ProxyHandler`]. There is deliberately no path routing on this listener:
//! CONNECT requests must reach the handler with the connection still intact.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{Result, TollgateError};
use crate::lifecycle::{Drain, DrainGuard};
use crate::proxy::handler::ProxyHandler;
use crate::proxy::middleware::ProxyAuth;

/// Proxy server
pub struct ProxyServer {
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: &ProxyServerConfig) -> Self {
        let auth = ProxyAuth::new(config.credentials.clone());

        Self {
            handler: Arc::new(ProxyHandler::new(auth)),
        }
    }

    /// Serve `listener` until `shutdown` flips, then drain.
    ///
    /// In-flight requests and tunnels get up to `drain_timeout` to finish.
    /// Anything still open afterwards is closed and
    /// [`TollgateError::ShutdownTimeout`] is returned.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Result<()> {
        let drain = Drain::new();

        if let Ok(addr) = listener.local_addr() {
            info!("Proxy server listening on {}", addr);
        }

        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            accept_failures = 0;
                            let handler = self.handler.clone();
                            let shutdown = shutdown.clone();
                            let guard = drain.guard();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                    shutdown,
                                    guard,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            let pause = accept_backoff(accept_failures);
                            accept_failures = accept_failures.saturating_add(1);
                            error!("Accept error: {} (retrying in {:?})", e, pause);
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = shutdown_requested(&mut shutdown) => {
                                    info!("Proxy server shutting down");
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        // Stop accepting before draining
        drop(listener);

        if drain.wait(drain_timeout).await {
            info!("Proxy server drained");
            Ok(())
        } else {
            Err(TollgateError::ShutdownTimeout {
                listener: "proxy",
                timeout: drain_timeout,
            })
        }
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        mut shutdown: watch::Receiver<bool>,
        mut guard: DrainGuard,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let service_guard = guard.clone();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let guard = service_guard.clone();

            async move { Ok::<_, Infallible>(handler.handle(req, client_addr, guard).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    return result
                        .map_err(|e| TollgateError::Http(format!("{}: {}", client_addr, e)));
                }
                _ = shutdown_requested(&mut shutdown), if !draining => {
                    // Finish the in-flight request, then close
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
                _ = guard.terminated() => {
                    debug!("Closing connection from {} at drain deadline", client_addr);
                    return Ok(());
                }
            }
        }
    }
}

/// Pause before retrying a failed accept (e.g. out of file descriptors).
///
/// Starts at 5ms and doubles per consecutive failure, capped at one second.
pub(crate) fn accept_backoff(consecutive_failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    BASE.saturating_mul(1u32 << consecutive_failures.min(16)).min(MAX)
}

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
