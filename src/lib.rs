//! Tollgate - Credential-gated forward proxy
//!
//! A small HTTP/HTTPS forward proxy that admits only clients presenting the
//! configured Basic credentials.
//!
//! ## Features
//!
//! - `Proxy-Authorization: Basic` gate on every request
//! - CONNECT tunneling with bidirectional byte relay
//! - Plain HTTP forwarding with streamed response bodies
//! - Liveness (`/healthz`) and readiness (`/readyz`) probes on a separate listener
//! - Graceful drain of both listeners within a bounded timeout

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod probes;
pub mod proxy;

pub use config::Config;
pub use error::{Result, TollgateError};
pub use lifecycle::Supervisor;
