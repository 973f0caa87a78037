//! Demo line-counter server.
//!
//! Every connection starts with the data `[1, 2, 3]`. Each received line is
//! answered with `[<pid>, <next item>]`, and the connection closes once the
//! list drains. Sending lines back-to-back keeps one handler process alive;
//! pausing longer than the read timeout rotates to a fresh process, with the
//! list position preserved.
//!
//! This binary is also the fixture for the end-to-end tests.

use clap::Parser;
use refork::ServerBuilder;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments, taking precedence over the config file.
#[derive(Parser, Debug)]
#[command(name = "refork")]
#[command(about = "Process-per-burst TCP demo server", long_about = None)]
struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Idle gap in milliseconds before rotating to a fresh process
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    server: ServerSection,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_read_timeout_ms")]
    read_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

fn default_port() -> u16 {
    12345
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let toml_config = match cli.config {
        Some(ref path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => TomlConfig::default(),
    };

    let port = cli.port.unwrap_or(toml_config.server.port);
    let read_timeout_ms = cli
        .read_timeout_ms
        .unwrap_or(toml_config.server.read_timeout_ms);

    let server = ServerBuilder::new(port, vec![1u32, 2, 3])
        .read_timeout(Duration::from_millis(read_timeout_ms))
        .on_connect(|_socket, peer, _data| {
            info!(peer = %peer, pid = std::process::id(), "client connected");
            Ok(())
        })
        .on_readable(|socket, data| {
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let next = data.remove(0);
            writeln!(socket, "[{}, {}]", std::process::id(), next)?;
            if data.is_empty() {
                socket.close()?;
            }
            Ok(())
        })
        .on_disconnect(|socket, _data| {
            info!(peer = %socket.peer_addr(), pid = std::process::id(), "client disconnected");
        })
        .build()?;

    server.serve()?;
    Ok(())
}
