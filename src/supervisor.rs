//! The supervising event loop.
//!
//! Single point of truth for "what can happen next." The wake set holds the
//! listening socket, the socket of every connection not currently owned by a
//! handler process, and the control channel of every running handler. Each
//! ready handle dispatches to exactly one action: accept, fork a handler for
//! a readable connection, or reclaim a handler's outcome. One zombie sweep
//! runs after each event batch.

use crate::child;
use crate::config::ServerConfig;
use crate::connection::{ConnectionRecord, ConnectionRegistry, Owner};
use crate::error::{Error, Result};
use crate::handoff;
use crate::reaper::Reaper;
use crate::server::Callbacks;
use crate::state::{StateDir, StateSlot};
use mio::net::{TcpListener, TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Token};
use nix::unistd::{fork, ForkResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub(crate) struct Supervisor<D> {
    config: ServerConfig,
    callbacks: Callbacks<D>,
    /// Initial connection data, pre-serialized; every handler deserializes
    /// its own copy.
    initial: Vec<u8>,
    poll: Poll,
    listener: TcpListener,
    registry: ConnectionRegistry,
    reaper: Reaper,
    state_dir: StateDir,
}

impl<D> Supervisor<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(config: ServerConfig, callbacks: Callbacks<D>, initial: Vec<u8>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let state_dir = StateDir::create(config.state_dir.as_deref())?;

        info!(
            addr = %addr,
            read_timeout_ms = config.read_timeout.as_millis() as u64,
            state_dir = %state_dir.path().display(),
            "listening"
        );

        Ok(Self {
            config,
            callbacks,
            initial,
            poll,
            listener,
            registry: ConnectionRegistry::new(),
            reaper: Reaper::new(),
            state_dir,
        })
    }

    /// The blocking supervisor loop. Runs until a fatal error.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.event_capacity);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready()?,
                    token => self.dispatch(token)?,
                }
            }

            self.reaper.reap();
        }
    }

    /// Drain the listener. A wake-up with no pending connection is a
    /// transient race, not an error.
    fn accept_ready(&mut self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            };

            let serial = self.registry.next_serial();
            let slot = StateSlot::new(self.state_dir.path(), serial);
            debug!(peer = %peer, serial, "accepted connection");

            // The connect event runs isolated, like every other event: the
            // very first handler is forked immediately and the socket never
            // joins the supervisor's wake set until it is handed back.
            self.spawn_handler(stream, peer, slot, true)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token) -> Result<()> {
        let idle = match self.registry.get(token.0) {
            Some(record) => record.owner.is_idle(),
            None => return Err(Error::WakeSet(token.0)),
        };
        if idle {
            self.connection_readable(token.0)
        } else {
            self.reclaim(token.0)
        }
    }

    /// An idle connection became readable: transfer it to a fresh handler.
    fn connection_readable(&mut self, conn_id: usize) -> Result<()> {
        let record = self.registry.remove(conn_id).ok_or(Error::WakeSet(conn_id))?;
        let ConnectionRecord { owner, peer, state } = record;
        let Owner::Idle(mut stream) = owner else {
            return Err(Error::WakeSet(conn_id));
        };

        self.poll.registry().deregister(&mut stream)?;
        self.spawn_handler(stream, peer, state, false)
    }

    /// Fork a handler for one connection event.
    ///
    /// The child ends up holding descriptors for exactly one connection: its
    /// own socket and its end of the new control channel. The parent closes
    /// its copy of the socket immediately; ownership lives with the child
    /// until reclaim.
    fn spawn_handler(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        slot: StateSlot,
        first_event: bool,
    ) -> Result<()> {
        let (sup_end, child_end) = StdUnixStream::pair()?;

        match unsafe { fork() }
            .map_err(|e| Error::Fork(io::Error::from_raw_os_error(e as i32)))?
        {
            ForkResult::Child => {
                drop(sup_end);
                let conn_fd = stream.as_raw_fd();
                self.close_inherited(conn_fd);

                let code = child::run(
                    conn_fd,
                    peer,
                    child_end,
                    &slot,
                    first_event,
                    &self.initial,
                    &mut self.callbacks,
                    self.config.read_timeout,
                );
                // No destructors, no atexit handlers: this process borrowed
                // the supervisor's address space and must not clean it up.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                // Ownership of the connection socket moved to the child.
                drop(stream);

                sup_end.set_nonblocking(true)?;
                let control = UnixStream::from_std(sup_end);
                let conn_id = self.registry.insert(ConnectionRecord {
                    owner: Owner::Child { pid: child, control },
                    peer,
                    state: slot,
                });
                if let Some(control) = self.registry.control_mut(conn_id) {
                    self.poll
                        .registry()
                        .register(control, Token(conn_id), Interest::READABLE)?;
                }
                self.reaper.track(child);
                debug!(
                    conn_id,
                    pid = child.as_raw(),
                    peer = %peer,
                    first_event,
                    "spawned handler"
                );
                Ok(())
            }
        }
    }

    /// A handler's control channel became ready: it either handed the socket
    /// back or exited, closing the connection.
    fn reclaim(&mut self, conn_id: usize) -> Result<()> {
        let record = self.registry.remove(conn_id).ok_or(Error::WakeSet(conn_id))?;
        let ConnectionRecord { owner, peer, state } = record;
        let Owner::Child { pid, mut control } = owner else {
            return Err(Error::WakeSet(conn_id));
        };

        self.poll.registry().deregister(&mut control)?;

        match handoff::recv_socket(&control) {
            Ok(Some(stream)) => {
                // Writes from the next handler must reach the peer promptly.
                stream.set_nodelay(true)?;
                let stream = TcpStream::from_std(stream);
                let conn_id = self.registry.insert(ConnectionRecord {
                    owner: Owner::Idle(stream),
                    peer,
                    state,
                });
                if let Some(stream) = self.registry.socket_mut(conn_id) {
                    self.poll
                        .registry()
                        .register(stream, Token(conn_id), Interest::READABLE)?;
                }
                debug!(conn_id, pid = pid.as_raw(), "socket handed back");
            }
            Ok(None) => {
                self.teardown(peer, &state);
                debug!(pid = pid.as_raw(), peer = %peer, "connection closed");
            }
            Err(e) => {
                // Any receive failure collapses to "no handoff": the safe
                // response is the same either way.
                warn!(pid = pid.as_raw(), peer = %peer, error = %e, "handoff receive failed");
                self.teardown(peer, &state);
            }
        }
        Ok(())
    }

    fn teardown(&mut self, peer: SocketAddr, state: &StateSlot) {
        if let Err(e) = state.delete() {
            warn!(peer = %peer, error = %e, "failed to delete state slot");
        }
    }

    /// Close, in a freshly forked child, every descriptor belonging to the
    /// listener or to other connections. Raw closes are safe here: the child
    /// exits via `_exit`, so no Rust owner will double-close them.
    fn close_inherited(&self, keep: libc::c_int) {
        unsafe { libc::close(self.listener.as_raw_fd()) };
        for fd in self.registry.inherited_fds_except(keep) {
            unsafe { libc::close(fd) };
        }
    }
}

/// TCP listener the supervisor multiplexes on.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}
