//! Proxy request dispatch and plain HTTP forwarding
//!
//! Every request on the proxy listener passes the authentication gate first,
//! then goes either to the CONNECT tunnel or to the HTTP forwarder.

use std::net::SocketAddr;

use http::request::Parts;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::error::{error_chain, Result, TollgateError};
use crate::lifecycle::DrainGuard;
use crate::logging::ConnectionInfo;
use crate::proxy::body::ProxyBody;
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::tunnel::TunnelHandler;

/// Proxy request dispatcher
pub struct ProxyHandler {
    auth: ProxyAuth,
    forwarder: HttpForwarder,
}

impl ProxyHandler {
    pub fn new(auth: ProxyAuth) -> Self {
        Self {
            auth,
            forwarder: HttpForwarder::new(),
        }
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        guard: DrainGuard,
    ) -> Response<ProxyBody> {
        let span = ConnectionInfo::from_request(&req, client_addr).span();
        self.dispatch(req, guard).instrument(span).await
    }

    async fn dispatch(&self, req: Request<Incoming>, guard: DrainGuard) -> Response<ProxyBody> {
        if let Err(e) = self.auth.validate(&req) {
            warn!("Proxy (unauthorized)");
            return e.to_response();
        }

        info!("Proxy");

        if req.method() == Method::CONNECT {
            TunnelHandler::handle(req, guard).await
        } else {
            self.forwarder.forward(req).await
        }
    }
}

/// Re-issues plain HTTP requests to their destination
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Incoming>,
}

impl HttpForwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.enforce_http(true);

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    /// Forward one request and relay the destination's response
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Forwarding failed");
                e.to_response()
            }
        }
    }

    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn try_forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = req.into_parts();
        parts.uri = outbound_uri(&parts)?;
        strip_hop_by_hop_headers(&mut parts.headers);

        debug!("Forwarding request to {}", parts.uri);

        let upstream = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| TollgateError::UpstreamRequest(error_chain(&e)))?;

        let (upstream_parts, upstream_body) = upstream.into_parts();
        let mut response = Response::new(upstream_body.boxed_unsync());
        *response.status_mut() = upstream_parts.status;
        copy_headers(response.headers_mut(), &upstream_parts.headers);

        Ok(response)
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute `http://` URI for the outbound request.
///
/// The destination is the request-target's authority when the client sent an
/// absolute URI, otherwise the `Host` header.
fn outbound_uri(parts: &Parts) -> Result<Uri> {
    let authority = match parts.uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TollgateError::InvalidTarget(parts.uri.to_string()))?,
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme("http")
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| TollgateError::InvalidTarget(format!("{}: {}", authority, e)))
}

/// Drop hop-by-hop headers, including the client's proxy credentials
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Copy every header from `src` onto `dst`, replacing any same-named values
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
