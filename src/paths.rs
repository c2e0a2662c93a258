//! Directory resolution for virgo.
//!
//! Provides a single `VirgoPaths` struct that resolves the standard
//! directories the tool uses:
//!
//! - Config:    `~/.config/virgo/`  (human-editable, XDG-style)
//! - Registry:  `~/.virgo/`  (projects, runtime ledger)
//! - Logs:      `~/Library/Logs/virgo/` on macOS, XDG data dir elsewhere
//!
//! The registry root is only a default: callers pass the resolved root
//! explicitly into [`crate::registry::Registry::open`].

use std::path::{Path, PathBuf};

const APP_NAME: &str = "virgo";
const REGISTRY_DIR: &str = ".virgo";

/// All resolved directory paths.
#[derive(Debug, Clone)]
pub struct VirgoPaths {
    /// Human-editable config: `~/.config/virgo/`
    pub config: PathBuf,
    /// Default registry root: `~/.virgo/`
    pub registry: PathBuf,
    /// Tool logs (not the per-project hypervisor console logs)
    pub logs: PathBuf,
}

impl VirgoPaths {
    /// Resolve all paths from the user's home directory. Nothing is created.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            registry: home.join(REGISTRY_DIR),
            logs: resolve_log_dir(&home),
        })
    }

    /// Default location of `config.toml`.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
