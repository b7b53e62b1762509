//! Single-threaded readiness event loop.
//!
//! The reactor owns the selector and the table of live connections. Each
//! iteration waits for a batch of ready sockets and dispatches the whole
//! batch before waiting again. Handler failures tear down the offending
//! connection only; the loop keeps serving everything else.

use crate::reactor::connection::{CloseReason, Connection, ConnectionReport};
use crate::reactor::selector::{Ready, Selector};
use mio::net::TcpListener;
use mio::Token;
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Token reserved for the listening socket. Connection tokens are slab
/// keys and never collide with it.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on bytes moved per receive so one busy peer cannot hog
/// the loop while others are ready.
pub const READ_BUF_SIZE: usize = 1024;

/// In `UntilCancelled` mode only this many per-connection reports are
/// retained; a long-lived server keeps a count beyond that, not a
/// record. Drain mode is caller-bounded and keeps them all.
const REPORT_CAP: usize = 1024;

/// When the loop decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep serving until cancellation is requested (server).
    UntilCancelled,
    /// Stop once no sockets remain registered (client).
    DrainAndStop,
}

/// The event loop. `run` consumes it; dropping it releases the poll
/// descriptor and every remaining socket.
pub struct Reactor {
    selector: Selector,
    connections: Slab<Connection>,
    listener: Option<TcpListener>,
    mode: RunMode,
    cancel: Arc<AtomicBool>,
    poll_timeout: Option<Duration>,
    max_connections: usize,
    batch: Vec<Ready>,
    reports: Vec<ConnectionReport>,
    report_cap: usize,
    closed_total: usize,
    #[cfg(test)]
    fail_wait: bool,
}

impl Reactor {
    pub fn new(
        mode: RunMode,
        cancel: Arc<AtomicBool>,
        max_connections: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            selector: Selector::new(max_connections.max(8))?,
            connections: Slab::with_capacity(max_connections.min(1024)),
            listener: None,
            mode,
            cancel,
            poll_timeout: None,
            max_connections,
            batch: Vec::new(),
            reports: Vec::new(),
            report_cap: REPORT_CAP,
            closed_total: 0,
            #[cfg(test)]
            fail_wait: false,
        })
    }

    /// Wake the wait call at this interval so the cancellation flag is
    /// observed even when no signal interrupts the syscall. `None` (the
    /// default) blocks until readiness or a signal.
    pub fn set_poll_timeout(&mut self, timeout: Option<Duration>) {
        self.poll_timeout = timeout;
    }

    /// Attach the listening socket. It stays registered for the lifetime
    /// of the loop.
    pub fn listen(&mut self, mut listener: TcpListener) -> io::Result<()> {
        self.selector
            .register(&mut listener, LISTENER_TOKEN, mio::Interest::READABLE)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Register an outbound connection (client bootstrap).
    pub fn add_connection(&mut self, conn: Connection) -> io::Result<Token> {
        if self.connections.len() >= self.max_connections {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "connection limit reached",
            ));
        }
        let conn_id = self.connections.insert(conn);
        let token = Token(conn_id);
        let conn = &mut self.connections[conn_id];
        if let Err(e) = self.selector.register(&mut conn.stream, token, conn.interest) {
            self.connections.remove(conn_id);
            return Err(e.into());
        }
        debug!(conn_id, peer = %self.connections[conn_id].peer, "connection registered");
        Ok(token)
    }

    /// Drive the loop until it stops, then tear down whatever is left and
    /// return the accounting for retained connections. Teardown runs on
    /// every exit path, a failing wait included, so registered sockets
    /// are released and accounted for before an error surfaces.
    pub fn run(mut self) -> io::Result<Vec<ConnectionReport>> {
        let result = self.drive();
        self.shutdown();
        debug!(connections_closed = self.closed_total, "reactor stopped");
        result?;
        Ok(self.reports)
    }

    fn drive(&mut self) -> io::Result<()> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                debug!("cancellation requested, stopping");
                return Ok(());
            }
            if self.mode == RunMode::DrainAndStop && self.selector.is_empty() {
                debug!("no registrations remain, stopping");
                return Ok(());
            }

            #[cfg(test)]
            if self.fail_wait {
                return Err(io::Error::new(io::ErrorKind::Other, "wait failed"));
            }

            self.selector.wait(self.poll_timeout, &mut self.batch)?;

            let batch = std::mem::take(&mut self.batch);
            for ready in &batch {
                if ready.token == LISTENER_TOKEN {
                    self.accept_ready();
                    continue;
                }
                if let Err(e) = self.connection_ready(*ready) {
                    debug!(conn_id = ready.token.0, error = %e, "connection error");
                    self.close_connection(ready.token, CloseReason::Error);
                }
            }
            self.batch = batch;
        }
    }

    /// Drain pending accepts. "Nothing to accept" is a no-op, not an
    /// error; the listener is never unregistered here.
    fn accept_ready(&mut self) {
        loop {
            let listener = match self.listener.as_ref() {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(peer = %peer, "connection limit reached, rejecting");
                        continue;
                    }
                    let conn_id = self.connections.insert(Connection::echo(stream, peer));
                    let conn = &mut self.connections[conn_id];
                    if let Err(e) =
                        self.selector
                            .register(&mut conn.stream, Token(conn_id), conn.interest)
                    {
                        warn!(peer = %peer, error = %e, "failed to register accepted connection");
                        self.connections.remove(conn_id);
                        continue;
                    }
                    debug!(conn_id, peer = %peer, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    /// Dispatch one ready connection. Read and write capabilities are
    /// checked independently; a read may tear the connection down, so its
    /// existence is re-checked before the write half runs.
    fn connection_ready(&mut self, ready: Ready) -> io::Result<()> {
        let conn_id = ready.token.0;
        if !self.connections.contains(conn_id) {
            // Torn down earlier in this batch.
            return Ok(());
        }

        if ready.readable {
            self.handle_readable(conn_id)?;
        }

        let wants_write = match self.connections.get(conn_id) {
            Some(conn) => conn.wants_write(),
            None => return Ok(()),
        };

        // The write half also runs when a read just queued bytes: the
        // send buffer of an idle socket is writable, so this drains the
        // echo in the same dispatch the way a permanently-armed WRITE
        // interest would, without spinning on it while idle.
        if ready.writable || wants_write {
            self.handle_writable(conn_id)?;
        }

        if let Some(conn) = self.connections.get_mut(conn_id) {
            let desired = conn.desired_interest();
            conn.interest = desired;
            // Reregister unconditionally: mio delivers edge-triggered
            // events, and rearming redelivers readiness the bounded
            // 1024-byte read did not drain, keeping every ready socket
            // revisited on a subsequent wait.
            self.selector
                .modify(&mut conn.stream, Token(conn_id), desired)?;
        }

        Ok(())
    }

    /// One bounded non-blocking receive.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(c) => c,
            None => return Ok(()),
        };

        let mut buf = [0u8; READ_BUF_SIZE];
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                // Peer closed its write side; unsent outbound is dropped.
                self.close_connection(Token(conn_id), CloseReason::PeerClosed);
                Ok(())
            }
            Ok(n) => {
                conn.inbound.extend_from_slice(&buf[..n]);
                conn.absorb_inbound(n);
                trace!(
                    conn_id,
                    bytes = n,
                    received_total = conn.received_total,
                    "received"
                );
                if conn.reply_complete() {
                    self.close_connection(Token(conn_id), CloseReason::ReplyComplete);
                }
                Ok(())
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One non-blocking send of however much the OS accepts. Partial
    /// writes leave the tail queued for the next writable dispatch.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(c) => c,
            None => return Ok(()),
        };

        conn.refill_outbound();
        if conn.outbound.is_empty() {
            return Ok(());
        }

        match conn.stream.write(&conn.outbound) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                conn.consume_outbound(n);
                trace!(
                    conn_id,
                    bytes = n,
                    pending = conn.outbound.len(),
                    "sent"
                );
                Ok(())
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the registration and close the socket, exactly once, as a
    /// single operation from the loop's perspective.
    fn close_connection(&mut self, token: Token, reason: CloseReason) {
        let conn_id = token.0;
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            if let Err(e) = self.selector.unregister(&mut conn.stream, token) {
                warn!(conn_id, error = %e, "failed to unregister connection");
            }
            debug!(
                conn_id,
                peer = %conn.peer,
                received = conn.received_total,
                sent = conn.sent_total,
                reason = ?reason,
                "connection closed"
            );
            self.closed_total += 1;
            if self.mode == RunMode::DrainAndStop || self.reports.len() < self.report_cap {
                self.reports.push(conn.report(reason));
            }
            // Dropping the connection closes the socket.
        }
    }

    /// STOPPED: release every remaining registration before returning.
    fn shutdown(&mut self) {
        let remaining: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in remaining {
            self.close_connection(Token(conn_id), CloseReason::Cancelled);
        }
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.selector.unregister(&mut listener, LISTENER_TOKEN) {
                warn!(error = %e, "failed to unregister listener");
            }
        }
        // The selector (and its poll descriptor) is dropped with the
        // reactor when `run` returns.
    }

    /// Number of live connections, excluding the listener.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::connection::Role;

    #[test]
    fn test_drain_mode_exits_when_empty() {
        let cancel = Arc::new(AtomicBool::new(false));
        let reactor = Reactor::new(RunMode::DrainAndStop, cancel, 16).unwrap();
        let reports = reactor.run().unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn test_cancelled_reactor_reports_open_connections() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut reactor = Reactor::new(RunMode::UntilCancelled, Arc::clone(&cancel), 16).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        let conn = Connection::client(
            mio::net::TcpStream::from_std(stream),
            addr,
            vec![b"unsent".to_vec()],
            6,
        );
        reactor.add_connection(conn).unwrap();

        // Cancellation was already requested; the loop must stop before
        // its first wait and still account for the open connection.
        let reports = reactor.run().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, CloseReason::Cancelled);
        assert_eq!(reports[0].received_total, 0);
    }

    #[test]
    fn test_connection_limit_rejects_add() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut reactor = Reactor::new(RunMode::DrainAndStop, cancel, 1).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let make_conn = || {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            stream.set_nonblocking(true).unwrap();
            Connection::client(mio::net::TcpStream::from_std(stream), addr, Vec::new(), 0)
        };

        reactor.add_connection(make_conn()).unwrap();
        assert!(reactor.add_connection(make_conn()).is_err());
        assert_eq!(reactor.active_connections(), 1);
    }

    #[test]
    fn test_server_mode_report_retention_is_capped() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut reactor = Reactor::new(RunMode::UntilCancelled, cancel, 8).unwrap();
        reactor.report_cap = 2;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _peers: Vec<std::net::TcpStream> = (0..3)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();
        for _ in 0..3 {
            let (stream, peer_addr) = listener.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            reactor
                .add_connection(Connection::echo(
                    mio::net::TcpStream::from_std(stream),
                    peer_addr,
                ))
                .unwrap();
        }

        // All three close on the cancellation path, but only the cap's
        // worth of reports is retained in server mode.
        let reports = reactor.run().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.reason == CloseReason::Cancelled));
    }

    #[test]
    fn test_drain_mode_keeps_all_reports_past_the_server_cap() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut reactor = Reactor::new(RunMode::DrainAndStop, cancel, 8).unwrap();
        reactor.report_cap = 1;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        for _ in 0..3 {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            stream.set_nonblocking(true).unwrap();
            reactor
                .add_connection(Connection::client(
                    mio::net::TcpStream::from_std(stream),
                    addr,
                    vec![b"queued".to_vec()],
                    6,
                ))
                .unwrap();
        }

        let reports = reactor.run().unwrap();
        assert_eq!(reports.len(), 3);
    }

    #[test]
    fn test_wait_failure_tears_down_before_surfacing() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut reactor = Reactor::new(RunMode::UntilCancelled, cancel, 4).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer_addr) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        reactor
            .add_connection(Connection::echo(
                mio::net::TcpStream::from_std(stream),
                peer_addr,
            ))
            .unwrap();

        reactor.fail_wait = true;
        let err = reactor.run().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);

        // The teardown path released the registered socket.
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let n = std::io::Read::read(&mut peer, &mut [0u8; 8]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_roles_are_fixed_shape() {
        // The tagged record replaces the original's dynamic attribute bag;
        // echo connections carry no client-only fields.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        let conn = Connection::echo(mio::net::TcpStream::from_std(stream), addr);
        assert!(matches!(conn.role, Role::Echo));
        assert!(!conn.reply_complete());
    }
}
