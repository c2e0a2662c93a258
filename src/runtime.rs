//! Runtime ledger: which instances of which projects are running.
//!
//! The ledger is a single JSON document at `<root>/runtime.json`, shared by
//! every invocation of the tool. [`RuntimeStore::open`] takes an exclusive
//! `flock` on `<root>/runtime.lock` and holds it until the store is dropped,
//! so a load → mutate → save sequence is never interleaved with another
//! invocation's. Saves go through a temp file and `rename`, so a crash never
//! leaves a half-written ledger behind.
//!
//! ```json
//! [{"ProjectName":"nginx",
//!   "Process":[{"Pid":4242,"Detached":true}],
//!   "Network":[{"Ip":"10.1.2.4","Gw":"10.1.2.1","Mac":"52:54:00:ab:cd:ef"}]}]
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::NetworkAllocation;
use crate::registry::Registry;
use crate::runner::{Attachment, ProcessHandle, StaleReason};

/// All instances of one project. `process[i]` and `network[i]` describe the
/// same instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeRecord {
    pub project_name: String,
    #[serde(default)]
    pub process: Vec<ProcessHandle>,
    #[serde(default)]
    pub network: Vec<NetworkAllocation>,
}

impl RuntimeRecord {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            process: Vec::new(),
            network: Vec::new(),
        }
    }

    /// `(handle, allocation)` pairs, one per instance.
    pub fn instances(&self) -> impl Iterator<Item = (&ProcessHandle, &NetworkAllocation)> {
        self.process.iter().zip(self.network.iter())
    }

    pub fn len(&self) -> usize {
        self.process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.process.is_empty()
    }

    fn push(&mut self, handle: ProcessHandle, network: NetworkAllocation) {
        self.process.push(handle);
        self.network.push(network);
    }
}

/// A ledger entry dropped at load time because its process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleInstance {
    pub project_name: String,
    pub handle: ProcessHandle,
    pub network: Option<NetworkAllocation>,
    pub reason: StaleReason,
}

/// Whether mutations reach the ledger file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadWrite,
    /// Mutations apply in memory only; used for dry runs.
    ReadOnly,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse the ledger at `path` and reattach every instance.
///
/// A missing file is an empty ledger. Instances whose pid no longer names a
/// process are dropped and reported, never fatal; records left with no
/// instances are dropped entirely.
pub fn load(path: &Path) -> Result<(Vec<RuntimeRecord>, Vec<StaleInstance>)> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no runtime ledger yet");
            return Ok((Vec::new(), Vec::new()));
        }
        Err(e) => return Err(Error::io(path, e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok((Vec::new(), Vec::new()));
    }

    let raw: Vec<RuntimeRecord> =
        serde_json::from_slice(&bytes).map_err(|source| Error::LedgerCorrupt {
            path: path.to_path_buf(),
            source,
        })?;

    let mut records = Vec::with_capacity(raw.len());
    let mut stale = Vec::new();

    for record in raw {
        if record.process.len() != record.network.len() {
            warn!(
                project = %record.project_name,
                processes = record.process.len(),
                networks = record.network.len(),
                "ledger record has mismatched instance lists; unpaired entries dropped"
            );
        }

        let mut live = RuntimeRecord::new(record.project_name.clone());
        let mut networks = record.network.into_iter();
        for handle in record.process {
            let network = networks.next();
            match (handle.attach(), network) {
                (Attachment::Attached(handle), Some(network)) => live.push(handle, network),
                (Attachment::Attached(handle), None) => stale.push(StaleInstance {
                    project_name: record.project_name.clone(),
                    handle,
                    network: None,
                    reason: StaleReason::InvalidPid,
                }),
                (Attachment::Stale { handle, reason }, network) => {
                    warn!(
                        project = %record.project_name,
                        pid = handle.pid,
                        %reason,
                        "skipping stale ledger entry"
                    );
                    stale.push(StaleInstance {
                        project_name: record.project_name.clone(),
                        handle,
                        network,
                        reason,
                    });
                }
            }
        }

        if !live.is_empty() {
            records.push(live);
        }
    }

    Ok((records, stale))
}

// ---------------------------------------------------------------------------
// RuntimeStore
// ---------------------------------------------------------------------------

/// The loaded ledger plus the lock that makes it safe to mutate.
pub struct RuntimeStore {
    path: PathBuf,
    mode: StoreMode,
    records: Vec<RuntimeRecord>,
    stale: Vec<StaleInstance>,
    _lock: Flock<File>,
}

impl std::fmt::Debug for RuntimeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeStore")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("records", &self.records)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl RuntimeStore {
    /// Lock and load the ledger of `registry`. Blocks while another
    /// invocation holds the lock.
    pub fn open(registry: &Registry, mode: StoreMode) -> Result<Self> {
        Self::open_at(&registry.runtime_file(), &registry.lock_file(), mode)
    }

    pub fn open_at(path: &Path, lock_path: &Path, mode: StoreMode) -> Result<Self> {
        let lock = acquire_lock(lock_path)?;
        let (records, stale) = load(path)?;
        debug!(
            path = %path.display(),
            records = records.len(),
            stale = stale.len(),
            "runtime ledger loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            records,
            stale,
            _lock: lock,
        })
    }

    pub fn records(&self) -> &[RuntimeRecord] {
        &self.records
    }

    /// Entries dropped at load time.
    pub fn stale(&self) -> &[StaleInstance] {
        &self.stale
    }

    pub fn find(&self, project_name: &str) -> Option<&RuntimeRecord> {
        self.records.iter().find(|r| r.project_name == project_name)
    }

    /// Append an instance to `project_name`'s record (creating it) and save.
    pub fn add(
        &mut self,
        project_name: &str,
        handle: ProcessHandle,
        network: NetworkAllocation,
    ) -> Result<()> {
        match self.records.iter_mut().find(|r| r.project_name == project_name) {
            Some(record) => record.push(handle, network),
            None => {
                let mut record = RuntimeRecord::new(project_name);
                record.push(handle, network);
                self.records.push(record);
            }
        }
        info!(project = project_name, pid = handle.pid, "instance recorded");
        self.save()
    }

    /// Remove the whole record for `project_name` and save. Returns the
    /// removed record, or `None` if the project had none.
    pub fn delete(&mut self, project_name: &str) -> Result<Option<RuntimeRecord>> {
        let Some(index) = self.records.iter().position(|r| r.project_name == project_name) else {
            return Ok(None);
        };
        let record = self.records.remove(index);
        info!(project = project_name, instances = record.len(), "record deleted");
        self.save()?;
        Ok(Some(record))
    }

    /// Records narrowed to the instances whose process is alive right now.
    /// Computed on every call; liveness is never cached in the ledger.
    pub fn running(&self) -> Vec<RuntimeRecord> {
        self.records
            .iter()
            .filter_map(|record| {
                let mut live = RuntimeRecord::new(record.project_name.clone());
                for (handle, network) in record.instances() {
                    if handle.is_alive() {
                        live.push(*handle, network.clone());
                    }
                }
                (!live.is_empty()).then_some(live)
            })
            .collect()
    }

    /// Network allocations of every live instance.
    pub fn running_allocations(&self) -> Vec<NetworkAllocation> {
        self.running()
            .into_iter()
            .flat_map(|record| record.network)
            .collect()
    }

    /// Atomically rewrite the ledger: temp file, fsync, rename.
    pub fn save(&self) -> Result<()> {
        if self.mode == StoreMode::ReadOnly {
            debug!(path = %self.path.display(), "read-only ledger, save skipped");
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(&self.records).map_err(|e| {
            Error::io(&self.path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| Error::io(&tmp, e))?;
            file.sync_all().map_err(|e| Error::io(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))?;

        debug!(path = %self.path.display(), records = self.records.len(), "runtime ledger saved");
        Ok(())
    }
}

fn acquire_lock(path: &Path) -> Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, source)| Error::Lock {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn network(octet: u8) -> NetworkAllocation {
        NetworkAllocation {
            ip: Ipv4Addr::new(10, 1, octet, 4),
            gw: Ipv4Addr::new(10, 1, octet, 1),
            mac: format!("52:54:00:00:00:{octet:02x}"),
        }
    }

    fn me() -> ProcessHandle {
        ProcessHandle::new(std::process::id() as i32, false)
    }

    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    fn open(dir: &Path) -> RuntimeStore {
        RuntimeStore::open_at(
            &dir.join("runtime.json"),
            &dir.join("runtime.lock"),
            StoreMode::ReadWrite,
        )
        .unwrap()
    }

    #[test]
    fn missing_ledger_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        assert!(store.records().is_empty());
        assert!(store.stale().is_empty());
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("runtime.json"), "[{\"ProjectName\":").unwrap();
        let err = RuntimeStore::open_at(
            &tmp.path().join("runtime.json"),
            &tmp.path().join("runtime.lock"),
            StoreMode::ReadWrite,
        )
        .unwrap_err();
        assert!(matches!(err, Error::LedgerCorrupt { .. }));
        assert!(err.to_string().contains("runtime.json"));
    }

    #[test]
    fn add_then_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = open(tmp.path());
            store.add("nginx", me(), network(2)).unwrap();
            store.add("alice/redis", me(), network(3)).unwrap();
            store.add("nginx", me(), network(4)).unwrap();
        }

        let store = open(tmp.path());
        let records = store.records();
        assert_eq!(records.len(), 2);

        let nginx = store.find("nginx").unwrap();
        assert_eq!(nginx.process, vec![me(), me()]);
        assert_eq!(nginx.network, vec![network(2), network(4)]);

        let redis = store.find("alice/redis").unwrap();
        assert_eq!(redis.process, vec![me()]);
        assert_eq!(redis.network, vec![network(3)]);
    }

    #[test]
    fn stale_entry_does_not_abort_loading() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = vec![
            RuntimeRecord {
                project_name: "gone".to_string(),
                process: vec![ProcessHandle::new(dead_pid(), true)],
                network: vec![network(2)],
            },
            RuntimeRecord {
                project_name: "zero".to_string(),
                process: vec![ProcessHandle::new(0, true)],
                network: vec![network(3)],
            },
            RuntimeRecord {
                project_name: "alive".to_string(),
                process: vec![me()],
                network: vec![network(4)],
            },
        ];
        std::fs::write(
            tmp.path().join("runtime.json"),
            serde_json::to_vec(&ledger).unwrap(),
        )
        .unwrap();

        let store = open(tmp.path());
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records()[0].project_name, "alive");

        let mut stale: Vec<_> = store.stale().iter().map(|s| s.project_name.as_str()).collect();
        stale.sort();
        assert_eq!(stale, vec!["gone", "zero"]);
    }

    #[test]
    fn delete_removes_every_instance() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = open(tmp.path());
            store.add("nginx", me(), network(2)).unwrap();
            store.add("nginx", me(), network(3)).unwrap();
            store.add("redis", me(), network(4)).unwrap();

            let removed = store.delete("nginx").unwrap().unwrap();
            assert_eq!(removed.len(), 2);
            assert!(store.delete("nginx").unwrap().is_none());
        }

        let store = open(tmp.path());
        assert!(store.find("nginx").is_none());
        assert!(store.find("redis").is_some());
    }

    #[test]
    fn running_allocations_cover_live_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open(tmp.path());
        store.add("nginx", me(), network(2)).unwrap();
        store.add("redis", me(), network(5)).unwrap();

        let running = store.running();
        assert_eq!(running.len(), 2);
        let octets: Vec<u8> = store.running_allocations().iter().map(|n| n.octet()).collect();
        assert_eq!(octets, vec![2, 5]);
    }

    #[test]
    fn read_only_store_never_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = RuntimeStore::open_at(
            &tmp.path().join("runtime.json"),
            &tmp.path().join("runtime.lock"),
            StoreMode::ReadOnly,
        )
        .unwrap();
        store.add("nginx", me(), network(2)).unwrap();
        assert_eq!(store.records().len(), 1);
        assert!(!tmp.path().join("runtime.json").exists());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open(tmp.path());
        store.add("nginx", me(), network(2)).unwrap();
        assert!(tmp.path().join("runtime.json").exists());
        assert!(!tmp.path().join("runtime.json.tmp").exists());
    }

    #[test]
    fn ledger_uses_wire_field_names() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open(tmp.path());
        store.add("nginx", me(), network(2)).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("runtime.json")).unwrap())
                .unwrap();
        let record = &json[0];
        assert_eq!(record["ProjectName"], "nginx");
        assert_eq!(record["Process"][0]["Pid"], me().pid);
        assert_eq!(record["Process"][0]["Detached"], false);
        assert_eq!(record["Network"][0]["Ip"], "10.1.2.4");
    }
}
