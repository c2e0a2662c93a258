//! User configuration loaded from `config.toml`.
//!
//! Every field has a default, so a missing file (or a file that sets only a
//! few keys) is valid. Values are resolved once in `main` and threaded
//! through constructors; nothing below reads the environment on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Root configuration container.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Registry root. `None` falls back to `~/.virgo`.
    pub root: Option<PathBuf>,
    /// Hypervisor binary launched for every instance.
    pub hypervisor: String,
    /// Prefix the hypervisor and host network plumbing with `sudo`.
    pub sudo: bool,
    pub timeouts: TimeoutConfig,
    pub package: PackageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for synchronous helper commands (preflight probes, sysctl).
    pub command_secs: u64,
    /// Upper bound for waiting on a process after its stop signal.
    pub stop_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Base URL of the HTTP package service.
    pub url: Option<String>,
    /// Local mirror directory used instead of the HTTP service.
    pub mirror: Option<PathBuf>,
    /// File holding the package service API token.
    pub token_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: None,
            hypervisor: "qemu-system-x86_64".to_string(),
            sudo: true,
            timeouts: TimeoutConfig::default(),
            package: PackageConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 30,
            stop_secs: 10,
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            url: None,
            mirror: None,
            token_file: PathBuf::from("~/.dprc"),
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        toml::from_str(&text).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.hypervisor, "qemu-system-x86_64");
        assert!(config.sudo);
        assert_eq!(config.timeouts.command(), Duration::from_secs(30));
        assert!(config.root.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "sudo = false\n[package]\nmirror = \"/srv/unikernels\"\n[timeouts]\nstop_secs = 3\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.sudo);
        assert_eq!(config.package.mirror, Some(PathBuf::from("/srv/unikernels")));
        assert_eq!(config.timeouts.stop(), Duration::from_secs(3));
        assert_eq!(config.timeouts.command_secs, 30);
        assert_eq!(config.hypervisor, "qemu-system-x86_64");
    }

    #[test]
    fn malformed_file_names_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "sudo = \"maybe\"").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("config.toml"));
    }
}
