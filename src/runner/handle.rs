//! Serializable reference to a launched process.
//!
//! A `ProcessHandle` is the only thing the ledger remembers about a running
//! hypervisor: its pid and whether it was started in its own process group.
//! Turning that back into something usable is [`ProcessHandle::attach`],
//! which checks that the pid still names a live process and reports a stale
//! reference instead of producing a handle that quietly claims "not alive".

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessHandle {
    pub pid: i32,
    pub detached: bool,
}

/// Outcome of reattaching to a handle loaded from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Attached(ProcessHandle),
    Stale { handle: ProcessHandle, reason: StaleReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The ledger entry holds a pid that can never name a process.
    InvalidPid,
    /// No process with this pid exists any more.
    NoSuchProcess,
    /// A detached handle whose pid no longer leads its own process group, so
    /// the pid has been reused by an unrelated process.
    NotGroupLeader,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPid => f.write_str("invalid pid"),
            Self::NoSuchProcess => f.write_str("no such process"),
            Self::NotGroupLeader => f.write_str("pid no longer leads its process group"),
        }
    }
}

impl ProcessHandle {
    pub fn new(pid: i32, detached: bool) -> Self {
        Self { pid, detached }
    }

    /// Look up the OS process behind a persisted handle.
    ///
    /// A process owned by another user (EPERM) still exists, so it attaches;
    /// whether it can be signalled is a separate question for
    /// [`ProcessHandle::is_alive`]. Detached instances are started as group
    /// leaders and must still be one.
    pub fn attach(self) -> Attachment {
        let stale = |reason| Attachment::Stale {
            handle: self,
            reason,
        };
        if self.pid <= 0 {
            return stale(StaleReason::InvalidPid);
        }
        let pid = Pid::from_raw(self.pid);
        match signal::kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return stale(StaleReason::NoSuchProcess),
        }
        if self.detached {
            match unistd::getpgid(Some(pid)) {
                Ok(pgid) if pgid != pid => return stale(StaleReason::NotGroupLeader),
                Err(Errno::ESRCH) => return stale(StaleReason::NoSuchProcess),
                _ => {}
            }
        }
        Attachment::Attached(self)
    }

    /// True iff the pid exists and accepts signals from us. Probes with the
    /// null signal, so the process is never perturbed.
    pub fn is_alive(&self) -> bool {
        self.pid > 0 && signal::kill(Pid::from_raw(self.pid), None).is_ok()
    }

    /// Send SIGTERM: to the whole process group for detached handles, to the
    /// single process otherwise. Never escalates.
    pub fn terminate(&self) -> Result<()> {
        if self.pid <= 0 {
            return Err(Error::Signal {
                pid: self.pid,
                source: Errno::ESRCH,
            });
        }
        let pid = Pid::from_raw(self.pid);
        let signal_err = |source| Error::Signal {
            pid: self.pid,
            source,
        };

        if self.detached {
            let pgid = unistd::getpgid(Some(pid)).map_err(signal_err)?;
            if pgid != pid {
                warn!(pid = self.pid, pgid = pgid.as_raw(), "not a group leader, refusing to signal");
                return Err(signal_err(Errno::ESRCH));
            }
            signal::killpg(pgid, Signal::SIGTERM).map_err(signal_err)?;
            info!(pid = self.pid, pgid = pgid.as_raw(), "SIGTERM sent to process group");
        } else {
            signal::kill(pid, Signal::SIGTERM).map_err(signal_err)?;
            info!(pid = self.pid, "SIGTERM sent");
        }
        Ok(())
    }

    /// Poll until the process is gone or `timeout` elapses. Used for
    /// processes we did not spawn and therefore cannot `wait()` on.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                debug!(pid = self.pid, "process exited");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pid = self.pid, ?timeout, "process still running after stop");
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}
