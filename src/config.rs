//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// How long a handler process waits for the next readable byte before it
/// persists the connection data and hands the socket back to the supervisor.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Idle-gap threshold that triggers a process handoff.
    pub read_timeout: Duration,
    /// Listen backlog.
    pub backlog: u32,
    /// Directory for per-connection state files. `None` uses a private
    /// temporary directory removed when the server exits.
    pub state_dir: Option<PathBuf>,
    /// Event batch capacity for each multiplexer wake-up.
    pub event_capacity: usize,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            read_timeout: DEFAULT_READ_TIMEOUT,
            backlog: 1024,
            state_dir: None,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(12345);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 12345);
        assert_eq!(config.read_timeout, Duration::from_secs(3));
        assert_eq!(config.backlog, 1024);
        assert!(config.state_dir.is_none());
    }
}
