//! Readiness multiplexer wrapping `mio::Poll`.
//!
//! Owns the registration table (token -> current interest) so the event
//! loop can ask "is anything still registered?" without touching the OS,
//! and so double-registration and stray modifications are caught as
//! explicit errors instead of silent epoll misbehavior.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// One entry of a wait batch: a ready socket and its ready capabilities.
///
/// Readable and writable are decoupled on purpose; a socket ready for
/// both performs both actions in a single dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Misuse of the registration table. These are programming errors in the
/// caller and are treated as fatal rather than handled per-connection.
#[derive(Debug)]
pub enum SelectorError {
    AlreadyRegistered(Token),
    NotRegistered(Token),
    Io(io::Error),
}

impl std::fmt::Display for SelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorError::AlreadyRegistered(token) => {
                write!(f, "token {:?} is already registered", token)
            }
            SelectorError::NotRegistered(token) => {
                write!(f, "token {:?} is not registered", token)
            }
            SelectorError::Io(e) => write!(f, "selector I/O error: {}", e),
        }
    }
}

impl std::error::Error for SelectorError {}

impl From<io::Error> for SelectorError {
    fn from(e: io::Error) -> Self {
        SelectorError::Io(e)
    }
}

impl From<SelectorError> for io::Error {
    fn from(e: SelectorError) -> Self {
        match e {
            SelectorError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Readiness multiplexer. Dropping it closes the poll descriptor.
pub struct Selector {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Interest>,
}

impl Selector {
    /// Create a selector. Failure here is fatal to the process; there is
    /// no loop without a readiness object.
    pub fn new(batch_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_capacity),
            registrations: HashMap::new(),
        })
    }

    /// Start monitoring a socket under `token`.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), SelectorError> {
        if self.registrations.contains_key(&token) {
            return Err(SelectorError::AlreadyRegistered(token));
        }
        self.poll.registry().register(source, token, interest)?;
        self.registrations.insert(token, interest);
        Ok(())
    }

    /// Replace the interest set of an already-registered socket.
    pub fn modify<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), SelectorError> {
        let entry = self
            .registrations
            .get_mut(&token)
            .ok_or(SelectorError::NotRegistered(token))?;
        self.poll.registry().reregister(source, token, interest)?;
        *entry = interest;
        Ok(())
    }

    /// Stop monitoring a socket. The caller pairs this with closing the
    /// socket, each exactly once.
    pub fn unregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> Result<(), SelectorError> {
        if self.registrations.remove(&token).is_none() {
            return Err(SelectorError::NotRegistered(token));
        }
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Current interest set for a token, if registered.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations.get(&token).copied()
    }

    /// Block until at least one registered socket is ready, the timeout
    /// elapses, or a signal interrupts the call. Ready pairs are drained
    /// into `batch`, reusing its allocation; an interrupted or timed-out
    /// wait leaves the batch empty so the caller re-checks its
    /// cancellation flag.
    pub fn wait(&mut self, timeout: Option<Duration>, batch: &mut Vec<Ready>) -> io::Result<()> {
        batch.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            batch.push(Ready {
                token: event.token(),
                // A half-closed peer reports read-closed; the read handler
                // must still run to observe the zero-length read.
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        Ok(())
    }

    /// True iff no sockets are registered. In drain mode this is the
    /// loop's termination signal.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }
}
