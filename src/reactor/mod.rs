//! Readiness-driven reactor core.
//!
//! Three pieces, leaf-first:
//! - `selector`: the readiness multiplexer and its registration table
//! - `connection`: per-socket state, tagged by role
//! - `event_loop`: the single-threaded loop that ties them together
//!
//! The server and client bootstraps in the crate root drive the same
//! loop with different connection roles.

mod connection;
mod event_loop;
mod selector;

pub use connection::{CloseReason, Connection, ConnectionReport, Role};
pub use event_loop::{Reactor, RunMode, READ_BUF_SIZE};
pub use selector::{Ready, Selector, SelectorError};
