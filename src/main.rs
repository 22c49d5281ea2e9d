//! echo-forkd: a TCP echo server
//!
//! Every byte a client sends is written back unchanged until the client
//! closes its side. Connections can be serviced:
//! - inline, one client at a time
//! - by a forked process per connection
//! - by a detached thread per connection
//!
//! Features:
//! - Optional daemon mode and privilege drop when started as root
//! - Periodic connection-count reports
//! - Configuration via CLI arguments or TOML file

mod config;
mod counter;
mod error;
mod lifecycle;
mod listener;
mod runtime;
mod server;
mod session;

use config::ServerConfig;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        mode = ?config.mode,
        daemonize = config.should_daemonize(),
        max_workers = config.max_workers,
        report_interval_ms = config.report_interval.as_millis() as u64,
        "Starting echo-forkd"
    );

    match Server::new(config).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
