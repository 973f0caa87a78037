//! Connection records and the supervisor-owned registry.
//!
//! Each accepted TCP connection has one record tracking which process
//! currently owns its socket. The two-variant [`Owner`] makes the
//! single-owner invariant structural: a record either parks the socket in the
//! supervisor or points at the one live handler process, never both.

use crate::state::StateSlot;
use mio::net::{TcpStream, UnixStream};
use nix::unistd::Pid;
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Who currently owns a connection's socket.
#[derive(Debug)]
pub(crate) enum Owner {
    /// The supervisor holds the socket, waiting for the next readable event.
    Idle(TcpStream),
    /// A forked handler owns the socket; the supervisor holds only the
    /// control channel it will use to hand the socket back.
    Child { pid: Pid, control: UnixStream },
}

impl Owner {
    /// The one descriptor the supervisor holds for this connection.
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Owner::Idle(stream) => stream.as_raw_fd(),
            Owner::Child { control, .. } => control.as_raw_fd(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Owner::Idle(_))
    }
}

/// One accepted TCP connection.
///
/// Created on accept, survives an unbounded number of fork cycles, and is
/// destroyed when a handler signals closure. `state` identifies the durable
/// slot bridging connection data across handler processes; it is stable for
/// the connection's lifetime.
#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    pub owner: Owner,
    pub peer: SocketAddr,
    pub state: StateSlot,
}

/// Registry of active connections, owned by the supervisor loop.
///
/// Slab keys double as multiplexer tokens. A connection registers exactly one
/// descriptor at a time (idle socket or control channel), so one token per
/// record is enough and dispatch goes by the record's owner state.
pub(crate) struct ConnectionRegistry {
    connections: Slab<ConnectionRecord>,
    /// Monotonic counter for state-slot naming; never reused, so a peer that
    /// reconnects is a brand-new connection with a fresh slot.
    next_serial: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            next_serial: 0,
        }
    }

    pub fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    pub fn insert(&mut self, record: ConnectionRecord) -> usize {
        self.connections.insert(record)
    }

    pub fn get(&self, id: usize) -> Option<&ConnectionRecord> {
        self.connections.get(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<ConnectionRecord> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Mutable access to the control channel of a child-owned connection.
    pub fn control_mut(&mut self, id: usize) -> Option<&mut UnixStream> {
        match self.connections.get_mut(id) {
            Some(ConnectionRecord {
                owner: Owner::Child { control, .. },
                ..
            }) => Some(control),
            _ => None,
        }
    }

    /// Mutable access to the socket of an idle connection.
    pub fn socket_mut(&mut self, id: usize) -> Option<&mut TcpStream> {
        match self.connections.get_mut(id) {
            Some(ConnectionRecord {
                owner: Owner::Idle(stream),
                ..
            }) => Some(stream),
            _ => None,
        }
    }

    /// Descriptors a freshly forked handler must close: every other
    /// connection's socket or control endpoint. A descriptor leaked into a
    /// handler keeps the corresponding peer's connection alive even after
    /// supervisor-side closure.
    pub fn inherited_fds_except(&self, keep: RawFd) -> Vec<RawFd> {
        self.connections
            .iter()
            .map(|(_, record)| record.owner.raw_fd())
            .filter(|&fd| fd != keep)
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
