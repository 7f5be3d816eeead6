//! Probe listener: liveness and readiness endpoints

pub mod handlers;
pub mod server;

pub use server::{ProbeServer, ReadinessCheck};
