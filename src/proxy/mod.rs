//! Proxy server implementation
//!
//! This module provides the proxy listener:
//! - Basic proxy authentication
//! - CONNECT tunnel for HTTPS
//! - Plain HTTP request forwarding

pub mod body;
pub mod handler;
pub mod middleware;
pub mod server;
pub mod tunnel;

pub use handler::{HttpForwarder, ProxyHandler};
pub use server::ProxyServer;
pub use tunnel::TunnelHandler;
