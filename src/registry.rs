//! On-disk project registry.
//!
//! ```text
//! <root>/
//!   runtime.json            ledger of running instances
//!   runtime.lock            advisory lock guarding the ledger
//!   projects/<name>/        plain project
//!   community/<owner>/<image>/
//!                           community project
//!
//! <project>/
//!   manifest
//!   kernel/<image>
//!   volumes/vol<id>
//!   logs/
//!   ifup.sh, ifdown.sh
//!   .pull/                  staging area of an unfinished pull
//! ```
//!
//! Plain and community projects live under separate roots, so `alice` and
//! `alice/redis` never share a subtree.
//!
//! There is no index file: [`Registry::open`] rediscovers projects by
//! scanning for manifests, so the registry heals itself across invocations.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::Manifest;

const PROJECTS_DIR: &str = "projects";
const COMMUNITY_DIR: &str = "community";
const STAGING_DIR: &str = ".pull";
const KERNEL_DIR: &str = "kernel";
const LOGS_DIR: &str = "logs";
const VOLUMES_DIR: &str = "volumes";
const MANIFEST_FILE: &str = "manifest";
const RUNTIME_FILE: &str = "runtime.json";
const LOCK_FILE: &str = "runtime.lock";
const IFUP_FILE: &str = "ifup.sh";
const IFDOWN_FILE: &str = "ifdown.sh";

// ---------------------------------------------------------------------------
// ProjectName
// ---------------------------------------------------------------------------

/// A validated project name: `image` or, for community images, `owner/image`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectName {
    owner: Option<String>,
    image: String,
}

impl ProjectName {
    /// Validate `name` without touching the filesystem.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidProjectName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("empty project name"));
        }

        let mut parts = name.split('/');
        let first = parts.next().unwrap_or_default();
        let Some(second) = parts.next() else {
            check_component(first).map_err(invalid)?;
            return Ok(Self {
                owner: None,
                image: first.to_string(),
            });
        };

        if parts.next().is_some() {
            return Err(invalid("community projects take the form owner/name"));
        }
        if first.is_empty() {
            return Err(invalid("owner can't be empty for community projects"));
        }
        if second.is_empty() {
            return Err(invalid("image name can't be empty for community projects"));
        }
        check_component(first).map_err(invalid)?;
        check_component(second).map_err(invalid)?;

        Ok(Self {
            owner: Some(first.to_string()),
            image: second.to_string(),
        })
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn is_community(&self) -> bool {
        self.owner.is_some()
    }
}

fn check_component(part: &str) -> std::result::Result<(), &'static str> {
    if part == "." || part == ".." {
        return Err("name components can't be '.' or '..'");
    }
    if part.chars().any(|c| c.is_whitespace() || c == '\\') {
        return Err("name can't contain whitespace or backslashes");
    }
    Ok(())
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{owner}/{}", self.image),
            None => f.write_str(&self.image),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A registered project and the paths of its subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    name: ProjectName,
    root: PathBuf,
}

impl Project {
    pub fn name(&self) -> &ProjectName {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.root.join(KERNEL_DIR)
    }

    /// Boot image, named after the image part of the project name.
    pub fn kernel_file(&self) -> PathBuf {
        self.kernel_dir().join(self.name.image())
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    pub fn volume_file(&self, id: u64) -> PathBuf {
        self.volumes_dir().join(format!("vol{id}"))
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn ifup_file(&self) -> PathBuf {
        self.root.join(IFUP_FILE)
    }

    pub fn ifdown_file(&self) -> PathBuf {
        self.root.join(IFDOWN_FILE)
    }

    /// Where a pull collects downloads before moving them into place.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Serial console log of the instance attached to `tap<index>`.
    pub fn console_log(&self, index: u8) -> PathBuf {
        self.logs_dir().join(format!("console-{index}.log"))
    }

    /// Directories created for every project.
    pub fn structure(&self) -> [PathBuf; 4] {
        [
            self.root.clone(),
            self.logs_dir(),
            self.kernel_dir(),
            self.volumes_dir(),
        ]
    }

    /// A manifest on disk marks a completed pull.
    pub fn is_pulled(&self) -> bool {
        self.manifest_file().is_file()
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        let path = self.manifest_file();
        if !path.exists() {
            return Err(Error::ProjectNotPulled {
                project: self.name.to_string(),
                path,
            });
        }
        Manifest::load(&path)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    projects: Vec<Project>,
}

impl Registry {
    /// Open (creating if needed) the registry at `root` and scan it for
    /// existing projects.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self {
            root: root.into(),
            projects: Vec::new(),
        };

        for dir in registry.structure() {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }

        registry.scan()?;
        debug!(
            root = %registry.root.display(),
            projects = registry.projects.len(),
            "registry opened"
        );
        Ok(registry)
    }

    /// Resolve or create the subtree for `name`. Idempotent.
    pub fn add_project(&mut self, name: &str) -> Result<Project> {
        let project = self.locate(name)?;

        for dir in project.structure() {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }

        if !self.projects.contains(&project) {
            info!(project = %project.name, root = %project.root.display(), "project added");
            self.projects.push(project.clone());
        }
        Ok(project)
    }

    /// Paths of the project called `name`, whether or not it exists. No I/O.
    pub fn locate(&self, name: &str) -> Result<Project> {
        Ok(self.project_for(ProjectName::parse(name)?))
    }

    /// Look up a registered project by its full name.
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name.to_string() == name)
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Recursively delete a project subtree. A missing subtree is not an error.
    pub fn purge_project(&mut self, name: &str) -> Result<()> {
        let project = self.locate(name)?;
        let root = project.root();

        match std::fs::remove_dir_all(root) {
            Ok(()) => info!(project = %project.name, "project purged"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(project = %project.name, "nothing to purge");
            }
            Err(e) => return Err(Error::io(root, e)),
        }

        // Drop the owner directory once its last community project is gone.
        if project.name.is_community() {
            if let Some(owner_dir) = root.parent() {
                let _ = std::fs::remove_dir(owner_dir);
            }
        }

        self.projects.retain(|p| p != &project);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    pub fn community_dir(&self) -> PathBuf {
        self.root.join(COMMUNITY_DIR)
    }

    pub fn runtime_file(&self) -> PathBuf {
        self.root.join(RUNTIME_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn structure(&self) -> [PathBuf; 3] {
        [self.root.clone(), self.projects_dir(), self.community_dir()]
    }

    fn project_for(&self, name: ProjectName) -> Project {
        let root = match name.owner() {
            Some(owner) => self.community_dir().join(owner).join(name.image()),
            None => self.projects_dir().join(name.image()),
        };
        Project { name, root }
    }

    /// Rebuild the in-memory project list from manifests on disk: one level
    /// under `projects/`, two under `community/`.
    fn scan(&mut self) -> Result<()> {
        for (dir, name) in list_dirs(&self.projects_dir())? {
            if dir.join(MANIFEST_FILE).is_file() {
                self.register_scanned(&name);
            }
        }
        for (owner_dir, owner) in list_dirs(&self.community_dir())? {
            for (dir, image) in list_dirs(&owner_dir)? {
                if dir.join(MANIFEST_FILE).is_file() {
                    self.register_scanned(&format!("{owner}/{image}"));
                }
            }
        }
        Ok(())
    }

    fn register_scanned(&mut self, name: &str) {
        match ProjectName::parse(name) {
            Ok(name) => {
                let project = self.project_for(name);
                if !self.projects.contains(&project) {
                    self.projects.push(project);
                }
            }
            Err(e) => warn!(error = %e, "skipping unrecognised project directory"),
        }
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            dirs.push((path, name.to_string()));
        }
    }
    dirs.sort();
    Ok(dirs)
}
