//! Project manifest: the declarative description of what to boot.
//!
//! The JSON shape is fixed by the package service and is persisted verbatim
//! as `<project>/manifest`:
//!
//! ```json
//! {"Processes":[{"Memory":64,"Kernel":"app","Multiboot":true,"Hash":"…",
//!   "Cmdline":"","Env":"","Volumes":[{"Id":7,"File":"etc.iso","Mount":"/etc"}]}]}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

/// One bootable process. Only the first spec of a manifest is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessSpec {
    /// Guest memory in megabytes.
    pub memory: u32,
    pub kernel: String,
    /// `true`: boot the image as a kernel with an append line.
    /// `false`: boot it as a raw disk.
    pub multiboot: bool,
    #[serde(rename = "Hash")]
    pub kernel_hash: String,
    pub cmdline: String,
    /// Space-separated `KEY=value` tokens.
    pub env: String,
    pub volumes: Vec<VolumeRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeRef {
    pub id: u64,
    #[serde(rename = "File", default)]
    pub source_file: String,
    #[serde(rename = "Mount", default)]
    pub mount_path: String,
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::from_slice(&bytes).map_err(|source| Error::InvalidManifest {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// The process spec that `run` boots, after checking it is launchable.
    pub fn primary(&self, project: &str) -> Result<&ProcessSpec> {
        let spec = self.processes.first().ok_or_else(|| Error::EmptyManifest {
            project: project.to_string(),
        })?;
        if spec.memory == 0 {
            return Err(Error::InvalidMemory {
                project: project.to_string(),
                memory: spec.memory,
            });
        }
        Ok(spec)
    }

    /// Every volume referenced by any process, in manifest order.
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeRef> {
        self.processes.iter().flat_map(|p| p.volumes.iter())
    }
}

impl ProcessSpec {
    /// Environment tokens, skipping the empty pieces left by repeated spaces.
    pub fn env_tokens(&self) -> impl Iterator<Item = &str> {
        self.env.split(' ').filter(|t| !t.is_empty())
    }
}
