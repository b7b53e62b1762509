//! Per-socket connection state.
//!
//! A `Connection` is created when a peer is accepted (server) or a
//! connect is initiated (client), and exists exactly as long as its
//! socket is registered with the selector. The role variant carries the
//! fields only one side needs instead of a loosely-typed bag.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Role-specific fields of a connection.
#[derive(Debug)]
pub enum Role {
    /// Server-side peer: everything read is echoed back.
    Echo,
    /// Client-side connection: sends queued payloads and reads replies
    /// until the expected total has arrived.
    Client {
        /// Total reply bytes after which the session is considered done.
        expected_total: usize,
        /// Payloads not yet moved into the outbound buffer, in send order.
        pending: VecDeque<Vec<u8>>,
    },
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its write side (zero-length read).
    PeerClosed,
    /// Client role only: the expected reply total arrived.
    ReplyComplete,
    /// The loop was cancelled with the connection still open.
    Cancelled,
    /// Transient I/O failure; details were logged at teardown.
    Error,
}

/// Final accounting for a closed connection.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub peer: SocketAddr,
    pub received_total: usize,
    pub sent_total: usize,
    pub reason: CloseReason,
}

/// State attached to one registered socket.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Interest currently registered with the selector.
    pub interest: Interest,
    /// Bytes read from the socket and not yet consumed by the role.
    pub inbound: BytesMut,
    /// Bytes accepted for sending but not yet taken by the OS.
    pub outbound: BytesMut,
    pub received_total: usize,
    pub sent_total: usize,
    pub role: Role,
}

impl Connection {
    /// Server-side peer state, created at accept.
    pub fn echo(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            interest: Interest::READABLE,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            received_total: 0,
            sent_total: 0,
            role: Role::Echo,
        }
    }

    /// Client-side state, created at connect initiation. `payloads` is
    /// the ordered list of messages to send; the session ends once
    /// `expected_total` reply bytes have arrived.
    pub fn client(
        stream: TcpStream,
        peer: SocketAddr,
        payloads: Vec<Vec<u8>>,
        expected_total: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            interest: Interest::READABLE | Interest::WRITABLE,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            received_total: 0,
            sent_total: 0,
            role: Role::Client {
                expected_total,
                pending: payloads.into(),
            },
        }
    }

    /// Account for `n` bytes just read into `inbound`. For the echo role
    /// the bytes move straight onto the outbound queue.
    pub fn absorb_inbound(&mut self, n: usize) {
        self.received_total += n;
        if let Role::Echo = self.role {
            let chunk = self.inbound.split();
            self.outbound.unsplit(chunk);
        }
    }

    /// Remove `n` bytes from the front of the outbound queue. Called only
    /// after the OS confirmed it accepted that many; a partial write
    /// leaves the remainder for the next dispatch.
    pub fn consume_outbound(&mut self, n: usize) {
        self.outbound.advance(n);
        self.sent_total += n;
    }

    /// Client role: move the next pending payload into an empty outbound
    /// buffer. Returns false when nothing was refilled.
    pub fn refill_outbound(&mut self) -> bool {
        if !self.outbound.is_empty() {
            return false;
        }
        match &mut self.role {
            Role::Client { pending, .. } => match pending.pop_front() {
                Some(payload) => {
                    self.outbound.extend_from_slice(&payload);
                    true
                }
                None => false,
            },
            Role::Echo => false,
        }
    }

    /// Client role terminal condition: the declared reply total has
    /// arrived. The comparison is `>=` so an overshooting peer cannot
    /// leave the session hanging short of an exact match.
    pub fn reply_complete(&self) -> bool {
        match self.role {
            Role::Client { expected_total, .. } => self.received_total >= expected_total,
            Role::Echo => false,
        }
    }

    /// True while the connection still has something to send, now or
    /// queued. Drives the dynamic WRITE interest.
    pub fn wants_write(&self) -> bool {
        if !self.outbound.is_empty() {
            return true;
        }
        match &self.role {
            Role::Client { pending, .. } => !pending.is_empty(),
            Role::Echo => false,
        }
    }

    /// Interest set the selector should track for the current state.
    pub fn desired_interest(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Final accounting record for teardown.
    pub fn report(&self, reason: CloseReason) -> ConnectionReport {
        ConnectionReport {
            peer: self.peer,
            received_total: self.received_total,
            sent_total: self.sent_total,
            reason,
        }
    }
}
