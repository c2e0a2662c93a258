//! Hypervisor side of virgo.
//!
//! Builds the QEMU invocation for a project, probes and prepares the host
//! it runs on, and drives the pull → run → kill → remove lifecycle on top of
//! the registry, the runtime ledger and a [`Runner`](crate::runner::Runner).

pub mod environment;
pub mod hypervisor;
pub mod lifecycle;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// How the hypervisor binary is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    /// Hypervisor binary, resolved through `PATH`.
    pub hypervisor: String,

    /// Run the hypervisor (and host network plumbing) through `sudo`. Tap
    /// devices can only be created by root.
    pub sudo: bool,
}

impl LaunchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hypervisor: config.hypervisor.clone(),
            sudo: config.sudo,
        }
    }

    /// `(program, args)` for running `command` with the configured privilege.
    pub fn privileged(&self, command: &str, args: Vec<String>) -> (String, Vec<String>) {
        if self.sudo {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(command.to_string());
            full.extend(args);
            ("sudo".to_string(), full)
        } else {
            (command.to_string(), args)
        }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use environment::{EnvironmentChecker, HostEnvironment, Preflight};
pub use hypervisor::Acceleration;
pub use lifecycle::{KillOutcome, Lifecycle, ProjectState, ProjectSummary};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_prefixes_sudo() {
        let settings = LaunchSettings {
            hypervisor: "qemu-system-x86_64".to_string(),
            sudo: true,
        };
        let (program, args) = settings.privileged("sysctl", vec!["-w".into(), "a=1".into()]);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["sysctl", "-w", "a=1"]);
    }

    #[test]
    fn unprivileged_runs_directly() {
        let settings = LaunchSettings {
            hypervisor: "qemu-system-x86_64".to_string(),
            sudo: false,
        };
        let (program, args) = settings.privileged("sysctl", vec!["-w".into()]);
        assert_eq!(program, "sysctl");
        assert_eq!(args, vec!["-w"]);
    }
}
