//! Non-blocking collection of exited handler processes.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::trace;

/// Tracks forked handler pids until the OS confirms their exit.
///
/// One sweep runs per supervisor wake cycle; it never blocks. A handler that
/// exits also closes its control channel, which wakes the supervisor, so
/// collection is prompt without any signal handling.
pub(crate) struct Reaper {
    pids: Vec<Pid>,
}

impl Reaper {
    pub fn new() -> Self {
        Self { pids: Vec::new() }
    }

    pub fn track(&mut self, pid: Pid) {
        self.pids.push(pid);
    }

    /// Collect every handler that has exited; leave the rest running.
    pub fn reap(&mut self) {
        self.pids.retain(|&pid| {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(status) => {
                    trace!(pid = pid.as_raw(), ?status, "reaped handler process");
                    false
                }
                // ECHILD: already collected elsewhere, nothing to track.
                Err(_) => false,
            }
        });
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.pids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, ForkResult};
    use std::time::{Duration, Instant};

    #[test]
    fn test_reaps_exited_child() {
        let mut reaper = Reaper::new();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => reaper.track(child),
        }
        assert_eq!(reaper.tracked(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while reaper.tracked() > 0 {
            assert!(Instant::now() < deadline, "child was never reaped");
            reaper.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_reap_does_not_block_on_live_child() {
        let mut reaper = Reaper::new();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                std::thread::sleep(Duration::from_millis(200));
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => reaper.track(child),
        }

        let start = Instant::now();
        reaper.reap();
        assert!(start.elapsed() < Duration::from_millis(100));

        // Collect it so the test leaves no zombie behind.
        std::thread::sleep(Duration::from_millis(300));
        reaper.reap();
        assert_eq!(reaper.tracked(), 0);
    }
}
