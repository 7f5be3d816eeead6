//! Dual-listener lifecycle
//!
//! Starting → Running → ShuttingDown → Stopped. Both listeners are bound up
//! front, served concurrently, and drained concurrently under one shared
//! timeout once a termination signal arrives.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Result, TollgateError};
use crate::lifecycle::signals::shutdown_signal;
use crate::probes::ProbeServer;
use crate::proxy::ProxyServer;

/// Aggregate result of shutting both listeners down.
///
/// Starts clean; either shutdown branch may mark it failed.
pub struct ShutdownOutcome {
    clean: AtomicBool,
}

impl ShutdownOutcome {
    pub fn new() -> Self {
        Self {
            clean: AtomicBool::new(true),
        }
    }

    /// Fold one listener's shutdown result into the outcome
    pub fn record(&self, listener: &'static str, result: Result<()>) {
        if let Err(e) = result {
            error!(listener, error = %e, "Server forced to shutdown");
            self.clean.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.clean.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownOutcome {
    fn default() -> Self {
        Self::new()
    }
}

/// Process supervisor owning both listeners
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM, then shut down
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Bind both listeners, then serve until `signal` resolves
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let proxy_listener = bind("proxy", self.config.proxy_addr()).await?;
        let probe_listener = bind("probes", self.config.probes_addr()).await?;

        self.serve(proxy_listener, probe_listener, signal).await
    }

    /// Serve on already-bound listeners until `signal` resolves.
    ///
    /// Returns [`TollgateError::ListenerFailed`] if either listener stops
    /// before the signal, and [`TollgateError::ShutdownFailed`] if either
    /// listener fails to drain within the shutdown timeout.
    pub async fn serve<F>(
        self,
        proxy_listener: TcpListener,
        probe_listener: TcpListener,
        signal: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let drain_timeout = self.config.shutdown_timeout;
        let proxy_server = ProxyServer::new(&self.config.proxy);
        let probe_server = ProbeServer::new(&self.config.probes)?;

        let (shutdown_tx, _) = watch::channel(false);
        let proxy_shutdown = shutdown_tx.subscribe();
        let probe_shutdown = shutdown_tx.subscribe();

        info!("Starting proxy server");
        let mut proxy_task = tokio::spawn(async move {
            proxy_server
                .run(proxy_listener, proxy_shutdown, drain_timeout)
                .await
        });

        info!("Starting probes server");
        let mut probe_task = tokio::spawn(async move {
            probe_server
                .run(probe_listener, probe_shutdown, drain_timeout)
                .await
        });

        tokio::pin!(signal);
        tokio::select! {
            _ = &mut signal => {
                info!("Shutdown signal received");
            }
            result = &mut proxy_task => {
                probe_task.abort();
                return Err(listener_failure("proxy", result));
            }
            result = &mut probe_task => {
                proxy_task.abort();
                return Err(listener_failure("probes", result));
            }
        }

        info!(timeout = ?drain_timeout, "Server shutting down gracefully");
        let _ = shutdown_tx.send(true);

        let outcome = ShutdownOutcome::new();
        tokio::join!(
            async { outcome.record("proxy", joined(proxy_task).await) },
            async { outcome.record("probes", joined(probe_task).await) },
        );

        if outcome.is_clean() {
            info!("Server shutdown successfully");
            Ok(())
        } else {
            Err(TollgateError::ShutdownFailed)
        }
    }
}

async fn bind(listener: &'static str, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TollgateError::ListenerFailed {
            listener,
            reason: format!("bind {}: {}", addr, e),
        })
}

async fn joined(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|e| TollgateError::Internal(e.to_string()))?
}

/// A listener task ended while it should still be serving
fn listener_failure(
    listener: &'static str,
    result: std::result::Result<Result<()>, JoinError>,
) -> TollgateError {
    match result {
        Ok(Err(e @ TollgateError::ListenerFailed { .. })) => e,
        Ok(Err(e)) => TollgateError::ListenerFailed {
            listener,
            reason: e.to_string(),
        },
        Ok(Ok(())) => TollgateError::ListenerFailed {
            listener,
            reason: "stopped unexpectedly".to_string(),
        },
        Err(e) => TollgateError::ListenerFailed {
            listener,
            reason: e.to_string(),
        },
    }
}
