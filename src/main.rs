//! Tollgate - Entry Point
//!
//! Starts the proxy and probe listeners and drains both on SIGINT/SIGTERM.

use std::process::ExitCode;

use tracing::{error, info};

use tollgate::config::{Config, LogConfig};
use tollgate::{logging, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Logging config comes from the environment too; fall back to defaults
            if logging::init(&LogConfig::default()).is_ok() {
                error!("Failed to load configuration: {}", e);
            } else {
                eprintln!("Failed to load configuration: {}", e);
            }
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.log) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "Starting Tollgate - Proxy: {}, Probes: {}",
        config.proxy_addr(),
        config.probes_addr()
    );

    match Supervisor::new(config).run().await {
        Ok(()) => {
            info!("Tollgate stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Tollgate stopped with error: {}", e);
            ExitCode::FAILURE
        }
    }
}
