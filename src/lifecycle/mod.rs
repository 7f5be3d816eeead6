//! Lifecycle management
//!
//! ```text
//! SIGTERM/SIGINT → shutdown flag → both listeners stop accepting
//!                → concurrent drain under one timeout → exit status
//! ```

pub mod drain;
pub mod signals;
pub mod supervisor;

pub use drain::{Drain, DrainGuard};
pub use supervisor::{ShutdownOutcome, Supervisor};
