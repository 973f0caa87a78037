//! refork: a TCP server that forks a fresh process for every burst of
//! connection activity.
//!
//! Each read-triggering event on a connection is serviced by a brand-new
//! operating-system process while the remote peer sees one continuous socket
//! connection. A supervising process multiplexes over listening sockets, idle
//! connection sockets, and the control channels of running handlers; each
//! handler receives the live socket across `fork`, runs the user callbacks,
//! and either hands the socket back over the control channel (after an idle
//! gap) or exits to close the connection. Connection data survives process
//! rotations through a file-backed state slot.
//!
//! Readability is serviced repeatedly inside one handler as long as data
//! keeps arriving without a gap: this is process-per-burst, not
//! process-per-byte.
//!
//! Unix only: the design is built on `fork` and `SCM_RIGHTS` descriptor
//! passing.
//!
//! # Example
//!
//! ```no_run
//! use refork::ServerBuilder;
//! use std::io::{Read, Write};
//!
//! let server = ServerBuilder::new(12345, vec![1u32, 2, 3])
//!     .on_readable(|socket, data| {
//!         let mut buf = [0u8; 64];
//!         socket.read(&mut buf)?;
//!         writeln!(socket, "[{}, {}]", std::process::id(), data.remove(0))?;
//!         if data.is_empty() {
//!             socket.close()?;
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//! server.serve()?;
//! # Ok::<(), refork::Error>(())
//! ```
//!
//! Each answered line carries the pid of the process that produced it: lines
//! typed back-to-back share a pid, and a line typed after a pause longer than
//! the read timeout (default 3 seconds) is answered by a different pid — with
//! the counter still advancing, because the connection data crossed the
//! rotation through its state slot.

mod child;
mod config;
mod connection;
mod error;
mod handoff;
mod reaper;
mod server;
mod state;
mod supervisor;

pub use child::ClientSocket;
pub use config::{ServerConfig, DEFAULT_READ_TIMEOUT};
pub use error::{Error, Result};
pub use server::{
    ConnectCallback, DisconnectCallback, ReadableCallback, Server, ServerBuilder,
};
pub use state::StateSlot;
