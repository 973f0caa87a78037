//! Durable per-connection state slots.
//!
//! Successive handler processes for one connection share no memory; the
//! connection data crosses process boundaries through a file-backed slot.
//! A handler writes the slot before handing its socket back, and the next
//! handler for the same connection reads it on startup. Only one handler is
//! ever active per connection, so the slot never has concurrent writers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A durable slot holding one serialized connection-data value.
///
/// The slot path is stable for the connection's entire lifetime and is keyed
/// by a connection serial that is never reused, so a reconnecting peer always
/// gets a fresh slot.
#[derive(Debug, Clone)]
pub struct StateSlot {
    path: PathBuf,
}

impl StateSlot {
    pub(crate) fn new(dir: &Path, serial: u64) -> Self {
        Self {
            path: dir.join(format!("conn-{serial}.state")),
        }
    }

    /// Read the stored value. A slot that has never been written is absent,
    /// not an error.
    pub fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrite the stored value unconditionally.
    pub fn save(&self, bytes: &[u8]) -> io::Result<()> {
        fs::write(&self.path, bytes)
    }

    /// Remove the slot. Succeeds silently if already absent.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Directory holding all state slots for one server instance.
#[derive(Debug)]
pub(crate) enum StateDir {
    /// Private temporary directory, removed when the supervisor exits.
    Temp(TempDir),
    /// Caller-provided directory, left in place.
    Fixed(PathBuf),
}

impl StateDir {
    pub fn create(configured: Option<&Path>) -> io::Result<Self> {
        match configured {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Ok(StateDir::Fixed(dir.to_path_buf()))
            }
            None => Ok(StateDir::Temp(tempfile::tempdir()?)),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            StateDir::Temp(dir) => dir.path(),
            StateDir::Fixed(path) => path,
        }
    }
}
