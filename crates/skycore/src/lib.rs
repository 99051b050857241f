//! skycore - connection, command, and registry engine for Skywatch peers
//!
//! Every Skywatch process — the central arbiter, device daemons, clients —
//! is built on the same substrate: a [`Block`] holding an arena of
//! [`Connection`]s, each with a strict one-at-a-time [`Command`] queue, a
//! mirror of the peer's declared values, and liveness clocks. One reactor
//! task per process owns all of it; socket readers and writers are dumb byte
//! pumps (`net` module) and every protocol decision runs to completion on
//! the reactor thread before the next I/O wait. There are no locks around
//! core state, by construction.
//!
//! Commands hold connection ids, never references; a command that outlives
//! its connection is cleaned up through the connection-loss path exactly
//! once, and dangling originator ids simply fail lookup.

pub mod block;
pub mod command;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod keepalive;
pub mod net;
pub mod value_store;

pub use block::{Address, Block};
pub use command::{Cip, Command, CommandKind, Outcome, SendAction};
pub use connection::{Advance, ConnState, Connection, OutFrame, PeerRole};
pub use error::CoreError;
pub use handlers::{DeviceHandler, PeerEvents};
pub use keepalive::{KeepaliveAction, KeepaliveClock, KeepaliveConfig};
pub use net::{flush_outbox, spawn_reader, spawn_writer, NetEvent, Outbound};
pub use value_store::{ValueEntry, ValueStore};

/// Stable small-integer id of a connection within its Block's arena.
///
/// Ids are assigned monotonically and never reused, so a stale id held by a
/// command or originator reference can only miss, never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
