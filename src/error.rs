//! Crate error type.

use std::io;

/// Errors surfaced by the server.
///
/// Failures inside a forked handler process never appear here: a handler that
/// fails simply exits without handing its socket back, which the supervisor
/// observes as an ordinary connection close.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configured connection data cannot round-trip through serialization.
    /// This is a caller error, reported before the server starts.
    #[error("connection data failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    /// `on_readable` is the primary unit of work and is mandatory.
    #[error("an on_readable callback is required")]
    MissingReadable,

    /// A woken handle matched no listener, idle socket, or child control
    /// channel. Internal bookkeeping is corrupt; the service must stop.
    #[error("woken handle matches no tracked connection (token {0})")]
    WakeSet(usize),

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
