//! Probe server using Axum
//!
//! Serves `/healthz` and `/readyz` on their own listener, independent of the
//! proxy listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::routing::get;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::config::ProbeServerConfig;
use crate::error::{error_chain, Result, TollgateError};
use crate::lifecycle::{Drain, DrainGuard};
use crate::proxy::server::{accept_backoff, shutdown_requested};

use super::handlers;

/// Outbound connectivity check behind `/readyz`
pub struct ReadinessCheck {
    client: reqwest::Client,
    url: Url,
}

impl ReadinessCheck {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self> {
        // Dial directly, the same way tunnels and forwarded requests do
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| TollgateError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Perform one GET. Any HTTP response counts as success.
    pub async fn check(&self) -> Result<()> {
        self.client
            .get(self.url.clone())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TollgateError::ReadinessCheck(error_chain(&e)))
    }
}

/// Shared state for probe handlers
#[derive(Clone)]
pub struct ProbeState {
    pub readiness: Arc<ReadinessCheck>,
}

/// Probe server
pub struct ProbeServer {
    state: ProbeState,
}

impl ProbeServer {
    /// Create a new probe server
    pub fn new(config: &ProbeServerConfig) -> Result<Self> {
        let readiness = ReadinessCheck::new(config.readiness_url.clone(), config.readiness_timeout)?;

        Ok(Self {
            state: ProbeState {
                readiness: Arc::new(readiness),
            },
        })
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(handlers::liveness))
            .route("/readyz", get(handlers::readiness))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve `listener` until `shutdown` flips, then drain.
    ///
    /// In-flight probe requests get up to `drain_timeout` to finish. Anything
    /// still open afterwards is closed and
    /// [`TollgateError::ShutdownTimeout`] is returned.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Result<()> {
        let drain = Drain::new();
        let router = self.build_router();

        if let Ok(addr) = listener.local_addr() {
            info!("Probe server listening on {}", addr);
        }

        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            accept_failures = 0;
                            let router = router.clone();
                            let shutdown = shutdown.clone();
                            let guard = drain.guard();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    remote_addr,
                                    router,
                                    shutdown,
                                    guard,
                                ).await {
                                    debug!("Probe connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            let pause = accept_backoff(accept_failures);
                            accept_failures = accept_failures.saturating_add(1);
                            error!("Probe accept error: {} (retrying in {:?})", e, pause);
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = shutdown_requested(&mut shutdown) => {
                                    info!("Probe server shutting down");
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Probe server shutting down");
                    break;
                }
            }
        }

        drop(listener);

        if drain.wait(drain_timeout).await {
            info!("Probe server drained");
            Ok(())
        } else {
            Err(TollgateError::ShutdownTimeout {
                listener: "probes",
                timeout: drain_timeout,
            })
        }
    }

    /// Serve the probe router on one connection
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        router: Router,
        mut shutdown: watch::Receiver<bool>,
        mut guard: DrainGuard,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        // Handlers read the peer address through `ConnectInfo`
        let service = router.map_request(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(remote_addr));
            req
        });

        let conn = http1::Builder::new()
            .serve_connection(io, TowerToHyperService::new(service));
        tokio::pin!(conn);

        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    return result
                        .map_err(|e| TollgateError::Http(format!("{}: {}", remote_addr, e)));
                }
                _ = shutdown_requested(&mut shutdown), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
                _ = guard.terminated() => {
                    debug!("Closing probe connection from {} at drain deadline", remote_addr);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::time::timeout;

    fn probe_server(readiness_url: &str) -> ProbeServer {
        ProbeServer::new(&ProbeServerConfig {
            port: 0,
            host: "127.0.0.1".parse().unwrap(),
            readiness_url: Url::parse(readiness_url).unwrap(),
            readiness_timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn test_router(server: &ProbeServer) -> Router {
        server
            .build_router()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    async fn get(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/", addr)
    }

    async fn reachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get_handler());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/", addr)
    }

    fn get_handler() -> axum::routing::MethodRouter {
        axum::routing::get(|| async { (StatusCode::NO_CONTENT, "") })
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let server = probe_server(&unreachable_url().await);
        let (status, body) = get(test_router(&server), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_readiness_ok_when_reachable() {
        let server = probe_server(&reachable_url().await);
        let (status, body) = get(test_router(&server), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_readiness_unavailable_when_unreachable() {
        let server = probe_server(&unreachable_url().await);
        let (status, body) = get(test_router(&server), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_not_found() {
        let server = probe_server(&unreachable_url().await);
        let (status, _) = get(test_router(&server), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = probe_server(&unreachable_url().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            server
                .run(listener, shutdown_rx, Duration::from_secs(1))
                .await
        });

        let response = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(format!("http://{}/healthz", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        shutdown.send(true).unwrap();
        let result = timeout(Duration::from_secs(2), task)
            .await
            .expect("probe server should stop")
            .unwrap();
        assert!(result.is_ok());
    }

    /// Destination that accepts connections and never answers
    async fn hanging_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_drain_deadline_closes_in_flight_requests() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = ProbeServer::new(&ProbeServerConfig {
            port: 0,
            host: "127.0.0.1".parse().unwrap(),
            readiness_url: Url::parse(&hanging_url().await).unwrap(),
            readiness_timeout: Duration::from_secs(30),
        })
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            server
                .run(listener, shutdown_rx, Duration::from_millis(200))
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /readyz HTTP/1.1\r\nHost: probes\r\n\r\n")
            .await
            .unwrap();
        // Let the readiness check start and hang
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.send(true).unwrap();
        let result = timeout(Duration::from_secs(2), task)
            .await
            .expect("probe server should stop at the drain deadline")
            .unwrap();
        assert!(matches!(
            result,
            Err(TollgateError::ShutdownTimeout { listener: "probes", .. })
        ));

        // The hanging request was cut off, not left open
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .expect("client socket should close at the deadline");
        match read {
            Ok(_) => assert!(buf.is_empty(), "no response expected, got {:?}", buf),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    #[tokio::test]
    async fn test_connect_info_reaches_handlers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = probe_server(&unreachable_url().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            server
                .run(listener, shutdown_rx, Duration::from_secs(1))
                .await
        });

        // Served without MockConnectInfo, so a missing peer address would be a 500
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: probes\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(2), client.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
        assert!(response.ends_with("OK"));

        shutdown.send(true).unwrap();
        assert!(timeout(Duration::from_secs(2), task).await.unwrap().unwrap().is_ok());
    }
}
