//! Echo server bootstrap.
//!
//! Binds the listening socket, registers it with the reactor, and runs
//! the loop until cancellation. Every accepted peer gets echoed back
//! exactly the bytes it sends.

use crate::config::Config;
use crate::reactor::{ConnectionReport, Reactor, RunMode};
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A bound but not yet running echo server.
pub struct Server {
    reactor: Reactor,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listening socket and register it. Port 0 binds an
    /// ephemeral port; `local_addr` reports the actual one.
    pub fn bind(config: &Config, cancel: Arc<AtomicBool>) -> io::Result<Self> {
        let addr: SocketAddr = config
            .addr()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let mut reactor = Reactor::new(RunMode::UntilCancelled, cancel, config.max_connections)?;
        reactor.listen(TcpListener::from_std(listener))?;

        info!(addr = %local_addr, max_connections = config.max_connections, "Server listening");

        Ok(Self {
            reactor,
            local_addr,
        })
    }

    /// Address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wake interval for observing the cancellation flag without a
    /// signal. Production leaves this unset and relies on EINTR.
    pub fn set_poll_timeout(&mut self, timeout: Option<Duration>) {
        self.reactor.set_poll_timeout(timeout);
    }

    /// Serve until cancelled; returns accounting for every connection
    /// that existed.
    pub fn run(self) -> io::Result<Vec<ConnectionReport>> {
        self.reactor.run()
    }
}

/// Build the non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::reactor::CloseReason;
    use std::io::{Read, Write};
    use std::sync::atomic::Ordering;

    fn test_config() -> Config {
        Config {
            mode: Mode::Server,
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 16,
            connections: 0,
            log_level: "info".to_string(),
        }
    }

    fn spawn_server(
        cancel: Arc<AtomicBool>,
    ) -> (
        SocketAddr,
        std::thread::JoinHandle<io::Result<Vec<ConnectionReport>>>,
    ) {
        let mut server = Server::bind(&test_config(), cancel).unwrap();
        server.set_poll_timeout(Some(Duration::from_millis(10)));
        let addr = server.local_addr();
        let handle = std::thread::spawn(move || server.run());
        (addr, handle)
    }

    #[test]
    fn test_hello_round_trip_then_half_close() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (addr, handle) = spawn_server(Arc::clone(&cancel));

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        peer.write_all(b"Hello").unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"Hello");

        cancel.store(true, Ordering::SeqCst);
        let reports = handle.join().unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, CloseReason::PeerClosed);
        assert_eq!(reports[0].received_total, 5);
        assert_eq!(reports[0].sent_total, 5);
    }

    #[test]
    fn test_each_peer_gets_its_own_bytes_back() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (addr, handle) = spawn_server(Arc::clone(&cancel));

        let payloads: [&[u8]; 3] = [b"alpha", b"bravo-bravo", b"c"];
        let mut peers: Vec<std::net::TcpStream> = payloads
            .iter()
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();

        for (peer, payload) in peers.iter_mut().zip(payloads.iter()) {
            peer.write_all(payload).unwrap();
            peer.shutdown(std::net::Shutdown::Write).unwrap();
        }

        for (peer, payload) in peers.iter_mut().zip(payloads.iter()) {
            let mut reply = Vec::new();
            peer.read_to_end(&mut reply).unwrap();
            assert_eq!(&reply, payload);
        }

        cancel.store(true, Ordering::SeqCst);
        let reports = handle.join().unwrap().unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|r| r.reason == CloseReason::PeerClosed && r.received_total == r.sent_total));
    }

    #[test]
    fn test_cancelled_server_releases_open_peers() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (addr, handle) = spawn_server(Arc::clone(&cancel));

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        peer.write_all(b"still open").unwrap();
        let mut reply = vec![0u8; 10];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"still open");

        // No half-close: the connection is still live when the server
        // stops, so teardown happens on the cancellation path.
        cancel.store(true, Ordering::SeqCst);
        let reports = handle.join().unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, CloseReason::Cancelled);

        // The released socket reads EOF on our side.
        let n = peer.read(&mut reply).unwrap();
        assert_eq!(n, 0);
    }
}
