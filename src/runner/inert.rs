//! Runner that executes nothing.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{ProcessHandle, Runner, render_command};
use crate::error::Result;

/// Records every command it is asked to run and, when echoing, prints it to
/// stdout. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct InertRunner {
    detached: bool,
    echo: bool,
    commands: Arc<Mutex<Vec<String>>>,
}

impl InertRunner {
    /// A silent runner; inspect what it saw with [`InertRunner::commands`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner that also prints each command, for `--dry`.
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Every command line recorded so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, line: String) {
        debug!(command = %line, detached = self.detached, "dry run");
        if self.echo {
            println!("{line}");
        }
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(line);
        }
    }
}

impl Runner for InertRunner {
    fn set_detached(&mut self, detached: bool) {
        self.detached = detached;
    }

    fn exec(&mut self, program: &str, args: &[String]) -> Result<Option<ProcessHandle>> {
        self.record(render_command(program, args));
        Ok(None)
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        self.record(render_command(program, args));
        Ok(Vec::new())
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        handle.is_alive()
    }

    async fn stop(&mut self, handle: &ProcessHandle) -> Result<()> {
        let target = if handle.detached {
            format!("-{}", handle.pid)
        } else {
            handle.pid.to_string()
        };
        self.record(format!("kill -TERM {target}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn records_exec_and_run_without_side_effects() {
        let mut runner = InertRunner::new();
        let handle = runner.exec("ping", &args(&["-c", "10", "127.0.0.1"])).unwrap();
        assert!(handle.is_none());

        let output = runner.run("which", &args(&["qemu-system-x86_64"])).await.unwrap();
        assert!(output.is_empty());

        assert_eq!(
            runner.commands(),
            vec!["ping -c 10 127.0.0.1", "which qemu-system-x86_64"]
        );
    }

    #[tokio::test]
    async fn stop_targets_group_for_detached_handles() {
        let mut runner = InertRunner::new();
        runner.stop(&ProcessHandle::new(4242, true)).await.unwrap();
        runner.stop(&ProcessHandle::new(4243, false)).await.unwrap();
        assert_eq!(runner.commands(), vec!["kill -TERM -4242", "kill -TERM 4243"]);
    }

    #[test]
    fn clones_share_the_record() {
        let mut runner = InertRunner::new();
        let observer = runner.clone();
        runner.exec("true", &[]).unwrap();
        assert_eq!(observer.commands(), vec!["true"]);
    }
}
