//! Public server API: callback registration and the blocking entry point.

use crate::child::ClientSocket;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Invoked once per connection, inside the first handler process, before the
/// first readable wait.
pub type ConnectCallback<D> =
    Box<dyn FnMut(&mut ClientSocket, SocketAddr, &mut D) -> io::Result<()>>;

/// Invoked for every readiness event while the connection is open. The
/// primary unit of work.
pub type ReadableCallback<D> = Box<dyn FnMut(&mut ClientSocket, &mut D) -> io::Result<()>>;

/// Invoked when the peer closes or resets the connection.
pub type DisconnectCallback<D> = Box<dyn FnMut(&mut ClientSocket, &mut D)>;

pub(crate) struct Callbacks<D> {
    pub on_connect: Option<ConnectCallback<D>>,
    pub on_readable: ReadableCallback<D>,
    pub on_disconnect: Option<DisconnectCallback<D>>,
}

/// Builder for a [`Server`].
///
/// `data` is the initial connection data handed to every newly accepted
/// connection; it is copied, not shared, across handler processes, so it must
/// round-trip through serialization.
pub struct ServerBuilder<D> {
    config: ServerConfig,
    data: D,
    on_connect: Option<ConnectCallback<D>>,
    on_readable: Option<ReadableCallback<D>>,
    on_disconnect: Option<DisconnectCallback<D>>,
}

impl<D> ServerBuilder<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(port: u16, data: D) -> Self {
        Self {
            config: ServerConfig::new(port),
            data,
            on_connect: None,
            on_readable: None,
            on_disconnect: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Idle-gap threshold that rotates the connection to a fresh process.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Directory for per-connection state files. Defaults to a private
    /// temporary directory.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = Some(dir.into());
        self
    }

    pub fn on_connect(
        mut self,
        f: impl FnMut(&mut ClientSocket, SocketAddr, &mut D) -> io::Result<()> + 'static,
    ) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_readable(
        mut self,
        f: impl FnMut(&mut ClientSocket, &mut D) -> io::Result<()> + 'static,
    ) -> Self {
        self.on_readable = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl FnMut(&mut ClientSocket, &mut D) + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Validate the options and serialize the initial connection data.
    pub fn build(self) -> Result<Server<D>> {
        let on_readable = self.on_readable.ok_or(Error::MissingReadable)?;
        let initial = serde_json::to_vec(&self.data)?;
        Ok(Server {
            config: self.config,
            callbacks: Callbacks {
                on_connect: self.on_connect,
                on_readable,
                on_disconnect: self.on_disconnect,
            },
            initial,
        })
    }
}

/// A process-per-burst TCP server.
pub struct Server<D> {
    config: ServerConfig,
    callbacks: Callbacks<D>,
    initial: Vec<u8>,
}

impl<D> Server<D>
where
    D: Serialize + DeserializeOwned,
{
    /// Run the supervisor loop forever. Never returns under normal
    /// operation; an `Err` means the service hit a fatal condition and must
    /// terminate rather than continue with a partially consistent wake set.
    pub fn serve(self) -> Result<()> {
        Supervisor::new(self.config, self.callbacks, self.initial)?.run()
    }
}
