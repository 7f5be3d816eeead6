use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use bytes::Bytes;
use hyper::header::{CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::Response;
use thiserror::Error;

use crate::proxy::body::{self, ProxyBody};

/// Challenge sent with every 407 response
pub const PROXY_AUTH_CHALLENGE: &str = "Basic realm=\"Restricted\"";

/// Unified error type for Tollgate
#[derive(Error, Debug)]
pub enum TollgateError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Authentication errors
    #[error("Missing Proxy-Authorization header")]
    MissingAuthHeader,

    #[error("Invalid Proxy-Authorization header")]
    InvalidAuthHeader,

    #[error("Failed to decode Proxy-Authorization header")]
    MalformedCredentials,

    #[error("Invalid credentials")]
    InvalidCredentials,

    // Destination errors
    #[error("{0}")]
    DestinationUnreachable(String),

    #[error("{0}")]
    UpstreamRequest(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    // Capability errors
    #[error("Connection upgrade not supported")]
    UpgradeUnsupported,

    // Probe errors
    #[error("{0}")]
    ReadinessCheck(String),

    // Lifecycle errors
    #[error("{listener} listener failed: {reason}")]
    ListenerFailed {
        listener: &'static str,
        reason: String,
    },

    #[error("{listener} listener did not drain within {timeout:?}")]
    ShutdownTimeout {
        listener: &'static str,
        timeout: Duration,
    },

    #[error("Graceful shutdown did not complete cleanly")]
    ShutdownFailed,

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Render an error together with its sources
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

impl TollgateError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            TollgateError::InvalidTarget(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            TollgateError::InvalidAuthHeader
            | TollgateError::MalformedCredentials
            | TollgateError::InvalidCredentials => StatusCode::UNAUTHORIZED,

            // 407 Proxy Authentication Required
            TollgateError::MissingAuthHeader => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            TollgateError::UpstreamRequest(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            TollgateError::DestinationUnreachable(_) | TollgateError::ReadinessCheck(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            TollgateError::UpgradeUnsupported
            | TollgateError::InvalidConfig(_)
            | TollgateError::MissingEnvVar(_)
            | TollgateError::ListenerFailed { .. }
            | TollgateError::ShutdownTimeout { .. }
            | TollgateError::ShutdownFailed
            | TollgateError::Http(_)
            | TollgateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text body sent to the client for this error
    fn body_text(&self) -> String {
        match self {
            TollgateError::MissingAuthHeader => "Proxy Authentication Required".to_string(),
            TollgateError::InvalidAuthHeader
            | TollgateError::MalformedCredentials
            | TollgateError::InvalidCredentials => "Unauthorized".to_string(),
            other => other.to_string(),
        }
    }

    /// Render this error as a proxy-listener response
    pub fn to_response(&self) -> Response<ProxyBody> {
        let mut response = Response::new(body::full(Bytes::from(self.body_text())));
        *response.status_mut() = self.status_code();

        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if matches!(self, TollgateError::MissingAuthHeader) {
            headers.insert(
                PROXY_AUTHENTICATE,
                hyper::header::HeaderValue::from_static(PROXY_AUTH_CHALLENGE),
            );
        }

        response
    }
}

// Implement IntoResponse for probe responses
impl IntoResponse for TollgateError {
    fn into_response(self) -> AxumResponse {
        (self.status_code(), self.body_text()).into_response()
    }
}
