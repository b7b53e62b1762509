//! Echo client bootstrap.
//!
//! Opens a set of concurrent connections, queues the same ordered list
//! of payloads on each, and drives the reactor in drain mode: the
//! process is done when every connection has received its expected reply
//! total and the registration table is empty.

use crate::config::Config;
use crate::reactor::{Connection, ConnectionReport, Reactor, RunMode};
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

/// Payloads sent on every connection when none are supplied.
pub const DEFAULT_MESSAGES: &[&[u8]] = &[b"Test message 1" as &[u8], b"Second test message"];

/// Open `config.connections` connections and run them to completion.
pub fn run(
    config: &Config,
    messages: &[&[u8]],
    cancel: Arc<AtomicBool>,
) -> io::Result<Vec<ConnectionReport>> {
    let addr: SocketAddr = config
        .addr()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    run_with(addr, config.connections, messages, cancel)
}

/// Lower-level entry point used by `run` and the tests.
pub fn run_with(
    addr: SocketAddr,
    connections: usize,
    messages: &[&[u8]],
    cancel: Arc<AtomicBool>,
) -> io::Result<Vec<ConnectionReport>> {
    let expected_total: usize = messages.iter().map(|m| m.len()).sum();
    if connections == 0 || expected_total == 0 {
        // Nothing to send means nothing to wait for; no registration is
        // ever created.
        debug!(connections, expected_total, "nothing to do");
        return Ok(Vec::new());
    }

    let mut reactor = Reactor::new(RunMode::DrainAndStop, cancel, connections)?;

    for conn_id in 0..connections {
        let stream = TcpStream::connect(addr)?;
        let payloads: Vec<Vec<u8>> = messages.iter().map(|m| m.to_vec()).collect();
        reactor.add_connection(Connection::client(stream, addr, payloads, expected_total))?;
        info!(conn_id, addr = %addr, expected_total, "connection initiated");
    }

    reactor.run()
}
