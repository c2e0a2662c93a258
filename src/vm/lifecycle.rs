//! Project lifecycle: pull → run → kill → remove.
//!
//! ## Architecture
//!
//! ```text
//! pull(name)   PackageService ─► .pull/ staging ─► kernel/<image>, volumes/vol<id>,
//!                  manifest (last)
//! run(name)    manifest ─► preflight ─► [lock ledger] ─► allocate ─► exec (detached)
//!                  ─► ledger.add ─► [unlock] ─► host forwarding
//! kill(name)   [lock ledger] ─► stop every instance ─► ledger.delete
//! remove(name) kill ─► purge project subtree
//! ```
//!
//! The ledger lock is held from allocation until the new instance is
//! recorded, so two concurrent `run`s can never pick the same network.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::LaunchSettings;
use super::environment::EnvironmentChecker;
use super::hypervisor;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::network::{self, NetworkAllocation};
use crate::package::PackageService;
use crate::registry::{Project, ProjectName, Registry};
use crate::runner::{ProcessHandle, Runner};
use crate::runtime::{RuntimeRecord, RuntimeStore, StoreMode};

/// Port the bundled guest applications listen on.
const GUEST_HTTP_PORT: u16 = 3000;

/// Derived state of a project. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProjectState {
    /// Known by name only; no complete pull on disk.
    Absent,
    /// Manifest and image are on disk, nothing launched.
    Pulled,
    Running { instances: usize },
    /// Launched earlier, but none of its instances is alive any more.
    Stopped,
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Pulled => f.write_str("pulled"),
            Self::Running { instances } => write!(f, "running ({instances})"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub name: String,
    #[serde(flatten)]
    pub state: ProjectState,
    pub networks: Vec<NetworkAllocation>,
}

/// A launched (or, under a dry run, previewed) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub project: String,
    pub network: NetworkAllocation,
    /// `None` when the runner did not actually start anything.
    pub handle: Option<ProcessHandle>,
}

impl Launch {
    pub fn url(&self) -> String {
        format!("http://{}:{GUEST_HTTP_PORT}", self.network.ip)
    }
}

#[derive(Debug)]
pub enum KillOutcome {
    /// The ledger holds no live instance of the project.
    NotRunning,
    Stopped {
        stopped: Vec<i32>,
        /// Instances whose stop signal failed. Their ledger entries are
        /// removed all the same.
        failures: Vec<(i32, Error)>,
    },
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub struct Lifecycle<R, P, E> {
    registry: Registry,
    runner: R,
    packages: P,
    environment: E,
    settings: LaunchSettings,
    mode: StoreMode,
}

impl<R, P, E> Lifecycle<R, P, E>
where
    R: Runner,
    P: PackageService,
    E: EnvironmentChecker,
{
    pub fn new(
        registry: Registry,
        runner: R,
        packages: P,
        environment: E,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            registry,
            runner,
            packages,
            environment,
            settings,
            mode: StoreMode::ReadWrite,
        }
    }

    /// Under [`StoreMode::ReadOnly`] no project file or ledger entry is
    /// written: `pull` only fetches and `remove` keeps the project subtree.
    pub fn with_store_mode(mut self, mode: StoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn store_mode(&self) -> StoreMode {
        self.mode
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn open_store(&self) -> Result<RuntimeStore> {
        RuntimeStore::open(&self.registry, self.mode)
    }

    /// Open the ledger for a mutation, persisting any stale entries dropped
    /// while loading.
    fn open_store_for_update(&self) -> Result<RuntimeStore> {
        let store = self.open_store()?;
        if !store.stale().is_empty() {
            info!(stale = store.stale().len(), "pruning stale ledger entries");
            store.save()?;
        }
        Ok(store)
    }

    // -- pull ---------------------------------------------------------------

    /// Fetch manifest, boot image and volumes of `name`.
    ///
    /// Everything is downloaded and written to the project's staging area
    /// before anything is moved into place, manifest last. A failed pull
    /// leaves an earlier pull of the project untouched. Under
    /// [`StoreMode::ReadOnly`] the downloads are fetched and discarded.
    pub async fn pull(&mut self, name: &str) -> Result<Project> {
        let parsed = ProjectName::parse(name)?;
        info!(project = %parsed, "pulling project");

        if self.mode == StoreMode::ReadOnly {
            let project = self.registry.locate(name)?;
            let download = self.fetch(&parsed).await?;
            info!(project = %parsed, bytes = download.len(), "dry run, pull not written");
            return Ok(project);
        }

        let project = self.registry.add_project(name)?;
        let staging = project.staging_dir();
        remove_dir_if_exists(&staging)?;

        let result = self.fetch(&parsed).await.and_then(|download| {
            download.stage(&project)?;
            download.promote(&project)
        });
        if let Err(e) = result {
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                warn!(project = %parsed, error = %cleanup, "unable to clear pull staging area");
            }
            return Err(e);
        }

        remove_dir_if_exists(&staging)?;
        info!(project = %parsed, "pull complete");
        Ok(project)
    }

    async fn fetch(&self, name: &ProjectName) -> Result<Download> {
        let manifest = self.packages.load_manifest(name).await?;
        let image = self.packages.download(name).await?;
        debug!(project = %name, bytes = image.len(), "image fetched");

        let mut volumes: Vec<(u64, Vec<u8>)> = Vec::new();
        for volume in manifest.volumes() {
            if volumes.iter().any(|(id, _)| *id == volume.id) {
                continue;
            }
            let bytes = self.packages.download_volume(volume.id).await?;
            debug!(project = %name, volume = volume.id, bytes = bytes.len(), "volume fetched");
            volumes.push((volume.id, bytes));
        }

        Ok(Download {
            manifest,
            image,
            volumes,
        })
    }

    // -- run ----------------------------------------------------------------

    /// Launch one more instance of a pulled project.
    pub async fn run(&mut self, name: &str) -> Result<Launch> {
        let project = self.registry.locate(name)?;
        let parsed = project.name().clone();
        let manifest = project.load_manifest()?;
        let spec = manifest.primary(name)?;

        let preflight = self.environment.preflight().await?;
        let acceleration = self.environment.has_acceleration().await;
        debug!(?acceleration, "acceleration selected");

        let launch = {
            let mut store = self.open_store_for_update()?;
            let network = NetworkAllocation::allocate(&store.running_allocations())?;
            info!(
                project = %parsed,
                ip = %network.ip,
                gw = %network.gw,
                mac = %network.mac,
                "network allocated"
            );

            if self.mode == StoreMode::ReadWrite {
                network::write_scripts(&project)?;
            }

            let (program, args) = hypervisor::launch_command(
                &self.settings,
                &project,
                spec,
                &network,
                acceleration,
            );

            self.runner.set_detached(true);
            let handle = self.runner.exec(&program, &args)?;

            if let Some(handle) = handle {
                store.add(name, handle, network.clone())?;
            }

            Launch {
                project: parsed.to_string(),
                network,
                handle,
            }
        };

        // The instance is committed at this point; a plumbing failure leaves
        // it running and recorded.
        if let Err(e) = self.environment.enable_forwarding(&preflight).await {
            warn!(project = %parsed, error = %e, "unable to enable host forwarding");
        }

        Ok(launch)
    }

    // -- kill / remove ------------------------------------------------------

    /// Stop every instance of `name` and drop its ledger record.
    pub async fn kill(&mut self, name: &str) -> Result<KillOutcome> {
        ProjectName::parse(name)?;
        let mut store = self.open_store_for_update()?;

        let Some(record) = store.find(name).cloned() else {
            debug!(project = name, "kill: not running");
            return Ok(KillOutcome::NotRunning);
        };

        let mut stopped = Vec::new();
        let mut failures = Vec::new();
        for handle in &record.process {
            match self.runner.stop(handle).await {
                Ok(()) => stopped.push(handle.pid),
                Err(e) => {
                    warn!(project = name, pid = handle.pid, error = %e, "unable to stop instance");
                    failures.push((handle.pid, e));
                }
            }
        }

        store.delete(name)?;
        info!(project = name, stopped = stopped.len(), failed = failures.len(), "project killed");
        Ok(KillOutcome::Stopped { stopped, failures })
    }

    /// Kill, then delete the project subtree. Purging happens whether or not
    /// anything was running.
    pub async fn remove(&mut self, name: &str) -> Result<KillOutcome> {
        let outcome = self.kill(name).await?;
        if self.mode == StoreMode::ReadOnly {
            info!(project = name, "dry run, project files kept");
        } else {
            self.registry.purge_project(name)?;
        }
        Ok(outcome)
    }

    // -- read-only views ----------------------------------------------------

    /// Records narrowed to live instances.
    pub fn ps(&self) -> Result<Vec<RuntimeRecord>> {
        Ok(self.open_store()?.running())
    }

    /// Every registered project with its derived state.
    pub fn projects(&self) -> Result<Vec<ProjectSummary>> {
        let store = self.open_store()?;
        let running = store.running();

        let mut summaries: Vec<ProjectSummary> = self
            .registry
            .projects()
            .iter()
            .map(|project| {
                let name = project.name().to_string();
                let live = running.iter().find(|r| r.project_name == name);
                let launched_before = store.find(&name).is_some()
                    || store.stale().iter().any(|s| s.project_name == name);

                let state = match live {
                    Some(record) => ProjectState::Running {
                        instances: record.len(),
                    },
                    None if launched_before => ProjectState::Stopped,
                    None if project.is_pulled() => ProjectState::Pulled,
                    None => ProjectState::Absent,
                };

                ProjectSummary {
                    name,
                    state,
                    networks: live.map(|r| r.network.clone()).unwrap_or_default(),
                }
            })
            .collect();

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    pub fn state(&self, name: &str) -> Result<ProjectState> {
        ProjectName::parse(name)?;
        Ok(self
            .projects()?
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.state)
            .unwrap_or(ProjectState::Absent))
    }

    /// Contents of every file in the project's logs directory, by path.
    pub fn logs(&self, name: &str) -> Result<Vec<(PathBuf, String)>> {
        ProjectName::parse(name)?;
        let Some(project) = self.registry.project(name) else {
            return Ok(Vec::new());
        };

        let dir = project.logs_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            if path.is_file() {
                let bytes = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
                files.push((path, String::from_utf8_lossy(&bytes).into_owned()));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// `ps` table: one row per live instance.
pub fn render_ps(records: &[RuntimeRecord]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .flat_map(|record| {
            record.instances().map(|(handle, network)| {
                vec![
                    record.project_name.clone(),
                    network.gw.to_string(),
                    network.ip.to_string(),
                    handle.pid.to_string(),
                    network.mac.clone(),
                ]
            })
        })
        .collect();
    render_table(&["PROJECT", "GW", "IP", "PID", "MAC"], &rows)
}

/// `list` table: one row per registered project.
pub fn render_projects(projects: &[ProjectSummary]) -> String {
    let rows: Vec<Vec<String>> = projects
        .iter()
        .map(|p| {
            let ips = p
                .networks
                .iter()
                .map(|n| n.ip.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            vec![p.name.clone(), p.state.to_string(), ips]
        })
        .collect();
    render_table(&["PROJECT", "STATE", "IP"], &rows)
}

fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header).chain(rows) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Everything a pull fetched, held until it is written out.
struct Download {
    manifest: Manifest,
    image: Vec<u8>,
    volumes: Vec<(u64, Vec<u8>)>,
}

impl Download {
    fn len(&self) -> usize {
        self.image.len() + self.volumes.iter().map(|(_, b)| b.len()).sum::<usize>()
    }

    /// Write every file into the staging area.
    fn stage(&self, project: &Project) -> Result<()> {
        let staging = project.staging_dir();
        std::fs::create_dir_all(&staging).map_err(|e| Error::io(&staging, e))?;

        write_file(&staging.join(STAGED_KERNEL), &self.image)?;
        for (id, bytes) in &self.volumes {
            write_file(&staging.join(format!("vol{id}")), bytes)?;
        }

        let encoded = serde_json::to_vec(&self.manifest).map_err(|e| {
            Error::io(
                staging.join(STAGED_MANIFEST),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        write_file(&staging.join(STAGED_MANIFEST), &encoded)
    }

    /// Move staged files over the project's own, manifest last.
    fn promote(&self, project: &Project) -> Result<()> {
        let staging = project.staging_dir();
        rename(&staging.join(STAGED_KERNEL), &project.kernel_file())?;
        for (id, _) in &self.volumes {
            rename(&staging.join(format!("vol{id}")), &project.volume_file(*id))?;
        }
        rename(&staging.join(STAGED_MANIFEST), &project.manifest_file())
    }
}

const STAGED_KERNEL: &str = "kernel";
const STAGED_MANIFEST: &str = "manifest";

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| Error::io(to, e))
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}
