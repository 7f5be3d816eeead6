//! Response body type shared by every proxy-listener response

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Body of every response written by the proxy listener.
///
/// Locally generated responses use a buffered body, forwarded responses stream
/// the destination's body through unchanged.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Buffered body from the given bytes
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Zero-length body
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
