//! Handler-process runtime.
//!
//! Runs inside a freshly forked process holding exactly one connection
//! socket. Readability is serviced repeatedly in a loop for as long as data
//! keeps arriving without an idle gap; the process rotates only when the
//! bounded wait strictly elapses with zero bytes available. On rotation the
//! connection data is persisted and the socket handed back to the supervisor;
//! on peer close, reset, or callback-initiated close the process exits
//! without a handoff and the supervisor tears the connection down.

use crate::handoff;
use crate::server::Callbacks;
use crate::state::StateSlot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, error};

/// The connection socket as seen by user callbacks.
///
/// `close` performs an orderly shutdown and marks the connection as finished;
/// the handler then exits without persisting state or handing the socket
/// back.
pub struct ClientSocket {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl ClientSocket {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Close the connection. After this the handler exits and the
    /// connection's state slot is discarded.
    pub fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown(Shutdown::Both)?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn at_eof(&self) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        Ok(self.stream.peek(&mut probe)? == 0)
    }
}

impl Read for ClientSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ClientSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Terminal disposition of one handler run.
#[derive(Debug, PartialEq)]
enum Disposition {
    /// Idle gap elapsed; state persisted and socket returned to the
    /// supervisor.
    HandedBack,
    /// Connection finished (peer close, reset, or callback close).
    Closed,
}

/// Entry point after fork. Returns the process exit code.
pub(crate) fn run<D>(
    conn_fd: RawFd,
    peer: SocketAddr,
    control: UnixStream,
    slot: &StateSlot,
    first_event: bool,
    initial: &[u8],
    callbacks: &mut Callbacks<D>,
    read_timeout: Duration,
) -> i32
where
    D: Serialize + DeserializeOwned,
{
    match serve_connection(
        conn_fd,
        peer,
        &control,
        slot,
        first_event,
        initial,
        callbacks,
        read_timeout,
    ) {
        Ok(disposition) => {
            debug!(peer = %peer, ?disposition, "handler finished");
            0
        }
        Err(e) => {
            error!(peer = %peer, error = %e, "handler failed");
            1
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn serve_connection<D>(
    conn_fd: RawFd,
    peer: SocketAddr,
    control: &UnixStream,
    slot: &StateSlot,
    first_event: bool,
    initial: &[u8],
    callbacks: &mut Callbacks<D>,
    read_timeout: Duration,
) -> io::Result<Disposition>
where
    D: Serialize + DeserializeOwned,
{
    let stream = unsafe { TcpStream::from_raw_fd(conn_fd) };
    // User callbacks expect ordinary blocking reads and writes.
    stream.set_nonblocking(false)?;
    let mut socket = ClientSocket::new(stream, peer);

    let stored = if first_event { None } else { slot.load()? };
    let mut data: D = match stored {
        Some(bytes) => serde_json::from_slice(&bytes)?,
        // First event, or a previous handler never reached a handoff: start
        // from a fresh copy of the configured initial data.
        None => serde_json::from_slice(initial)?,
    };

    if first_event {
        if let Some(on_connect) = callbacks.on_connect.as_mut() {
            if let Err(e) = on_connect(&mut socket, peer, &mut data) {
                return finish_on_error(e, &mut socket, &mut data, callbacks);
            }
        }
        if socket.is_closed() {
            return Ok(Disposition::Closed);
        }
    }

    loop {
        if !wait_readable(socket.stream.as_raw_fd(), read_timeout)? {
            // Idle gap: persist whatever the callbacks have built up, then
            // return the socket so the next burst gets a fresh process.
            slot.save(&serde_json::to_vec(&data)?)?;
            socket.stream.set_nonblocking(true)?;
            handoff::send_fd(control, socket.stream.as_raw_fd())?;
            return Ok(Disposition::HandedBack);
        }

        match socket.at_eof() {
            Ok(true) => {
                if let Some(on_disconnect) = callbacks.on_disconnect.as_mut() {
                    on_disconnect(&mut socket, &mut data);
                }
                return Ok(Disposition::Closed);
            }
            Ok(false) => {}
            Err(e) => return finish_on_error(e, &mut socket, &mut data, callbacks),
        }

        if let Err(e) = (callbacks.on_readable)(&mut socket, &mut data) {
            return finish_on_error(e, &mut socket, &mut data, callbacks);
        }
        if socket.is_closed() {
            return Ok(Disposition::Closed);
        }
    }
}

/// A peer reset is routed to the disconnect callback and closes the
/// connection; anything else propagates as a handler failure. Either way no
/// handoff happens.
fn finish_on_error<D>(
    e: io::Error,
    socket: &mut ClientSocket,
    data: &mut D,
    callbacks: &mut Callbacks<D>,
) -> io::Result<Disposition> {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    ) {
        if let Some(on_disconnect) = callbacks.on_disconnect.as_mut() {
            on_disconnect(socket, data);
        }
        return Ok(Disposition::Closed);
    }
    Err(e)
}

/// Bounded readability wait.
///
/// Returns `true` if the descriptor became readable (or reached an error or
/// hangup condition, which the caller discovers on the next read) and `false`
/// only if the timeout strictly elapsed with zero ready descriptors.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        return Ok(ready > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_wait_readable_sees_data() {
        let (mut client, server) = tcp_pair();
        client.write_all(b"x").unwrap();
        assert!(wait_readable(server.as_raw_fd(), Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_wait_readable_times_out_strictly() {
        let (_client, server) = tcp_pair();
        let start = Instant::now();
        let ready = wait_readable(server.as_raw_fd(), Duration::from_millis(120)).unwrap();
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(110));
    }

    #[test]
    fn test_wait_readable_reports_peer_close() {
        let (client, server) = tcp_pair();
        drop(client);
        assert!(wait_readable(server.as_raw_fd(), Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_client_socket_close_and_eof() {
        let (client, server) = tcp_pair();
        let peer = server.peer_addr().unwrap();
        let mut socket = ClientSocket::new(server, peer);

        assert!(!socket.is_closed());
        drop(client);
        assert!(socket.at_eof().unwrap());

        socket.close().unwrap();
        assert!(socket.is_closed());
        // Idempotent.
        socket.close().unwrap();
    }
}
