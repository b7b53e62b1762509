//! echoplex: a single-threaded readiness-driven TCP echo server and client
//!
//! One event loop multiplexes many sockets: a blocking wait reports
//! which are ready for read and/or write, and per-connection handlers
//! perform bounded non-blocking I/O. The `server` subcommand echoes
//! every peer until interrupted; the `client` subcommand opens N
//! concurrent connections, sends a fixed list of payloads on each, and
//! exits once every reply has arrived.

mod client;
mod config;
mod reactor;
mod server;
mod shutdown;

use config::{Config, Mode};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // SIGINT/SIGTERM request a clean stop of whichever loop is running.
    let cancel = Arc::new(AtomicBool::new(false));
    shutdown::install(Arc::clone(&cancel))?;

    match config.mode {
        Mode::Server => {
            info!(
                host = %config.host,
                port = config.port,
                max_connections = config.max_connections,
                "Starting echo server"
            );
            let server = server::Server::bind(&config, cancel)?;
            server.run()?;
            info!("Server stopped");
        }
        Mode::Client => {
            info!(
                host = %config.host,
                port = config.port,
                connections = config.connections,
                "Starting echo client"
            );
            let reports = client::run(&config, client::DEFAULT_MESSAGES, cancel)?;
            for (conn_id, report) in reports.iter().enumerate() {
                info!(
                    conn_id,
                    peer = %report.peer,
                    sent = report.sent_total,
                    received = report.received_total,
                    reason = ?report.reason,
                    "Connection finished"
                );
            }
        }
    }

    Ok(())
}
