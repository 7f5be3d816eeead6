//! Liveness and readiness endpoints

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, error, Instrument};

use crate::error::Result;
use crate::logging::ConnectionInfo;

use super::server::ProbeState;

/// Liveness probe: the process is up and serving
pub async fn liveness(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> impl IntoResponse {
    ConnectionInfo::from_request(&req, remote_addr)
        .span()
        .in_scope(|| debug!("Liveness"));

    (StatusCode::OK, "OK")
}

/// Readiness probe: outbound connectivity works
pub async fn readiness(
    State(state): State<ProbeState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<impl IntoResponse> {
    let span = ConnectionInfo::from_request(&req, remote_addr).span();

    async move {
        debug!("Readiness");

        if let Err(e) = state.readiness.check().await {
            error!(error = %e, url = %state.readiness.url(), "Readiness");
            return Err(e);
        }

        Ok((StatusCode::OK, "OK"))
    }
    .instrument(span)
    .await
}
