//! Runner backed by real OS processes.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use super::{ProcessHandle, Runner, render_command};
use crate::error::{Error, Result};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts processes with `tokio::process`.
///
/// `exec` must be called from inside a Tokio runtime: each started child
/// gets a reaper task on the current runtime. Dropping the runner does NOT
/// stop anything it started.
#[derive(Debug)]
pub struct ExecRunner {
    detached: bool,
    command_timeout: Duration,
    stop_timeout: Duration,
    /// Exit notifications for children spawned by this runner, by pid.
    reaped: HashMap<i32, oneshot::Receiver<io::Result<ExitStatus>>>,
}

impl Default for ExecRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, DEFAULT_STOP_TIMEOUT)
    }
}

impl ExecRunner {
    /// `command_timeout` bounds [`Runner::run`]; `stop_timeout` bounds the
    /// wait for exit after [`Runner::stop`].
    pub fn new(command_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            detached: false,
            command_timeout,
            stop_timeout,
            reaped: HashMap::new(),
        }
    }

    /// Forget children whose reaper has already reported an exit.
    fn prune_reaped(&mut self) {
        self.reaped
            .retain(|_, rx| matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}

impl Runner for ExecRunner {
    fn set_detached(&mut self, detached: bool) {
        self.detached = detached;
    }

    fn exec(&mut self, program: &str, args: &[String]) -> Result<Option<ProcessHandle>> {
        self.prune_reaped();
        let command_line = render_command(program, args);

        let mut cmd = Command::new(program);
        cmd.args(args.iter().filter(|a| !a.is_empty()));
        cmd.stdin(Stdio::null());
        if self.detached {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let Some(raw_pid) = child.id() else {
            // Only possible if the child was already polled to completion.
            return Err(Error::Spawn {
                command: command_line,
                source: io::Error::other("process exited before its pid was read"),
            });
        };
        let pid = raw_pid as i32;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            match &status {
                Ok(status) => debug!(pid, %status, "child reaped"),
                Err(e) => warn!(pid, error = %e, "error waiting for child"),
            }
            let _ = tx.send(status);
        });
        self.reaped.insert(pid, rx);

        info!(pid, detached = self.detached, command = %command_line, "process started");
        Ok(Some(ProcessHandle::new(pid, self.detached)))
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let command_line = render_command(program, args);

        let mut cmd = Command::new(program);
        cmd.args(args.iter().filter(|a| !a.is_empty()));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| Error::CommandTimeout {
                command: command_line.clone(),
                after: self.command_timeout,
            })?
            .map_err(|source| Error::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command_line,
                status: output.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&combined).trim().to_string(),
            });
        }

        debug!(command = %command_line, bytes = combined.len(), "command finished");
        Ok(combined)
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        handle.is_alive()
    }

    async fn stop(&mut self, handle: &ProcessHandle) -> Result<()> {
        handle.terminate()?;

        // Our own child: wait for the reaper so no zombie keeps the pid alive.
        if let Some(rx) = self.reaped.remove(&handle.pid) {
            match tokio::time::timeout(self.stop_timeout, rx).await {
                Ok(Ok(Ok(status))) => info!(pid = handle.pid, %status, "process stopped"),
                Ok(Ok(Err(e))) => warn!(pid = handle.pid, error = %e, "process stopped, wait failed"),
                Ok(Err(_)) => debug!(pid = handle.pid, "reaper already gone"),
                Err(_) => warn!(
                    pid = handle.pid,
                    timeout = ?self.stop_timeout,
                    "process did not exit after SIGTERM"
                ),
            }
            return Ok(());
        }

        // A process from an earlier invocation: detached groups are only
        // signalled, foreground processes are waited for by polling.
        if !handle.detached {
            handle.wait_for_exit(self.stop_timeout).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn runner() -> ExecRunner {
        ExecRunner::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn foreground_process_lifecycle() {
        let mut runner = runner();
        let handle = runner.exec("sleep", &args(&["30"])).unwrap().unwrap();
        assert!(!handle.detached);
        assert!(runner.is_alive(&handle));

        runner.stop(&handle).await.unwrap();
        assert!(!runner.is_alive(&handle));
    }

    #[tokio::test]
    async fn detached_process_gets_its_own_group() {
        let mut runner = runner();
        runner.set_detached(true);
        let handle = runner.exec("sleep", &args(&["30"])).unwrap().unwrap();
        assert!(handle.detached);
        assert!(runner.is_alive(&handle));

        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(handle.pid))).unwrap();
        assert_eq!(pgid.as_raw(), handle.pid);

        runner.stop(&handle).await.unwrap();
        assert!(!runner.is_alive(&handle));
    }

    #[tokio::test]
    async fn missing_binary_fails_with_command() {
        let mut runner = runner();
        let err = runner
            .exec("definitely-not-a-real-binary-virgo", &args(&["--flag"]))
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-binary-virgo --flag"));
    }

    #[tokio::test]
    async fn run_returns_combined_output() {
        let runner = runner();
        let out = runner
            .run("sh", &args(&["-c", "echo out; echo err 1>&2"]))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let runner = runner();
        let err = runner.run("sh", &args(&["-c", "echo nope; exit 3"])).await.unwrap_err();
        match err {
            Error::CommandFailed { status, output, .. } => {
                assert_eq!(status, 3);
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_is_bounded() {
        let runner = ExecRunner::new(Duration::from_millis(200), Duration::from_secs(1));
        let err = runner.run("sleep", &args(&["5"])).await.unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn stopping_an_exited_process_is_an_error() {
        let mut runner = runner();
        let handle = runner.exec("true", &[]).unwrap().unwrap();
        // Let the reaper collect it.
        handle.wait_for_exit(Duration::from_secs(5)).await;

        let err = runner.stop(&handle).await.unwrap_err();
        assert!(matches!(err, Error::Signal { .. }));
    }

    #[tokio::test]
    async fn exited_children_are_forgotten() {
        let mut runner = runner();
        for _ in 0..3 {
            let handle = runner.exec("true", &[]).unwrap().unwrap();
            handle.wait_for_exit(Duration::from_secs(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let handle = runner.exec("sleep", &args(&["30"])).unwrap().unwrap();
        assert_eq!(runner.reaped.len(), 1);
        assert!(runner.reaped.contains_key(&handle.pid));

        runner.stop(&handle).await.unwrap();
        assert!(runner.reaped.is_empty());
    }
}
