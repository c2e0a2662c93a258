//! Error types shared by every virgo component.
//!
//! Variants are grouped the way callers need to react to them: configuration
//! problems are rejected before any I/O, exhaustion is fatal for the current
//! launch, and I/O or process failures carry the path or command line that
//! produced them.

use std::path::PathBuf;
use std::time::Duration;

/// Errors from registry, ledger, runner and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --- configuration ---
    /// Project name failed `name` / `owner/image` validation.
    #[error("invalid project name '{name}': {reason}")]
    InvalidProjectName { name: String, reason: &'static str },

    /// The manifest lists no process specs, so there is nothing to boot.
    #[error("manifest for '{project}' has no processes, unable to proceed")]
    EmptyManifest { project: String },

    /// A process spec asks for zero megabytes of guest memory.
    #[error("manifest for '{project}' requests {memory} MB of memory")]
    InvalidMemory { project: String, memory: u32 },

    /// The project has not been pulled (no manifest on disk).
    #[error("project '{project}' has not been pulled (missing {path})")]
    ProjectNotPulled { project: String, path: PathBuf },

    /// The TOML configuration file could not be parsed.
    #[error("invalid configuration in {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    // --- resource exhaustion ---
    /// Every third-octet value up to the reserved top of the range is taken.
    #[error("ip range is exhausted, unable to allocate a network for a new instance")]
    NetworkExhausted,

    // --- I/O ---
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A manifest file exists but is not valid manifest JSON.
    #[error("unable to load manifest file {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The runtime ledger exists but could not be parsed.
    #[error("runtime ledger {path} is corrupt: {source}")]
    LedgerCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The ledger lock could not be acquired.
    #[error("unable to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    // --- processes ---
    /// The command could not be started at all.
    #[error("error running '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal to a tracked process (or its group) failed.
    #[error("unable to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    /// A synchronous helper command exited unsuccessfully.
    #[error("'{command}' exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// A synchronous helper command did not finish in time and was killed.
    #[error("'{command}' did not finish within {after:?}")]
    CommandTimeout { command: String, after: Duration },

    /// The configured hypervisor binary is not installed.
    #[error("{binary} not found\nYou can install it\n- via homebrew: brew install qemu\n- via your distribution: apt install qemu-system-x86\n- manually: https://www.qemu.org/download/#source")]
    HypervisorMissing { binary: String },

    /// The tun/tap kernel extension is not loaded (macOS).
    #[error("tuntap not found\nPlease download and install tuntaposx\nhttp://downloads.sourceforge.net/tuntaposx/tuntap_20150118.tar.gz")]
    TunTapMissing,

    // --- collaborators ---
    /// The package service failed to deliver a manifest, image or volume.
    #[error("package service failed for {resource}: {source}")]
    Package {
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Neither a package service URL nor a local mirror is configured.
    #[error("no package service configured (set [package] url or mirror in config.toml)")]
    PackageServiceUnconfigured,
}

impl Error {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a package service failure for `resource`.
    pub fn package(
        resource: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Package {
            resource: resource.into(),
            source: source.into(),
        }
    }
}

/// Result type for virgo operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_the_path() {
        let err = Error::io(
            "/tmp/virgo/runtime.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/virgo/runtime.json"));
    }

    #[test]
    fn spawn_error_names_the_command() {
        let err = Error::Spawn {
            command: "sudo qemu-system-x86_64 -m 64".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("sudo qemu-system-x86_64 -m 64"), "got: {msg}");
    }
}
