//! Process-wide tracing subscriber
//!
//! Built exactly once from [`LogConfig`] during startup. `RUST_LOG`, when set,
//! takes precedence over the level derived from `DEBUG`.

use std::net::SocketAddr;

use hyper::Request;
use tracing::{info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};
use crate::error::{Result, TollgateError};

/// Install the global subscriber
pub fn init(config: &LogConfig) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},hyper=info,reqwest=info")));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    installed.map_err(|e| TollgateError::Internal(format!("failed to install logger: {}", e)))
}

/// Connection metadata attached to every per-request log entry
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub host: String,
    pub proto: String,
    pub method: String,
    pub url: String,
}

impl ConnectionInfo {
    pub fn from_request<B>(req: &Request<B>, remote_addr: SocketAddr) -> Self {
        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(hyper::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            remote_addr,
            host,
            proto: format!("{:?}", req.version()),
            method: req.method().to_string(),
            url: req.uri().to_string(),
        }
    }

    /// Span carrying the connection metadata; events inside it are tagged
    /// with every field.
    pub fn span(&self) -> Span {
        info_span!(
            "conn",
            remote_addr = %self.remote_addr,
            host = %self.host,
            proto = %self.proto,
            method = %self.method,
            url = %self.url,
        )
    }
}
