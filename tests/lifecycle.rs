//! End-to-end lifecycle tests against real processes.
//!
//! A throwaway shell script stands in for the hypervisor: it accepts any
//! arguments and sleeps, which is all the lifecycle needs from it. Package
//! contents come from a mirror directory, and the host environment is
//! stubbed, so these run on any Unix machine without QEMU, sudo or network.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use virgo::network::NetworkAllocation;
use virgo::package::MirrorPackageService;
use virgo::registry::Registry;
use virgo::runner::{ExecRunner, ProcessHandle};
use virgo::runtime::{RuntimeRecord, RuntimeStore, StoreMode};
use virgo::vm::lifecycle::{KillOutcome, Lifecycle, ProjectState};
use virgo::vm::{Acceleration, EnvironmentChecker, LaunchSettings, Preflight};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct StubEnvironment;

impl EnvironmentChecker for StubEnvironment {
    async fn preflight(&self) -> virgo::Result<Preflight> {
        Ok(Preflight::default())
    }

    async fn has_acceleration(&self) -> Acceleration {
        Acceleration::None
    }

    async fn enable_forwarding(&self, _preflight: &Preflight) -> virgo::Result<()> {
        Ok(())
    }
}

type TestLifecycle = Lifecycle<ExecRunner, MirrorPackageService, StubEnvironment>;

struct Fixture {
    tmp: tempfile::TempDir,
    root: PathBuf,
    mirror: PathBuf,
    hypervisor: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let mirror = tmp.path().join("mirror");

        let project = mirror.join("nginx");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(mirror.join("volumes")).unwrap();
        std::fs::write(
            project.join("manifest"),
            r#"{"Processes":[{"Memory":64,"Kernel":"nginx","Multiboot":true,"Hash":"","Cmdline":"nginx","Env":"","Volumes":[{"Id":7,"File":"etc.iso","Mount":"/etc"}]}]}"#,
        )
        .unwrap();
        std::fs::write(project.join("image"), b"kernel").unwrap();
        std::fs::write(mirror.join("volumes").join("vol7"), b"etc").unwrap();

        let hypervisor = tmp.path().join("fake-qemu");
        std::fs::write(&hypervisor, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&hypervisor, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            tmp,
            root,
            mirror,
            hypervisor,
        }
    }

    /// Swap in a hypervisor that, like QEMU, runs its tap `script=` a little
    /// after starting. `sudo` is replaced by `echo`, so each tap's ifup
    /// output lands in `<returned dir>/<tap>`.
    fn capture_ifup(&self) -> PathBuf {
        let bin = self.tmp.path().join("bin");
        let out = self.tmp.path().join("ifup-output");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        let sudo = bin.join("sudo");
        std::fs::write(&sudo, "#!/bin/sh\necho \"$@\"\n").unwrap();
        std::fs::set_permissions(&sudo, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hypervisor = format!(
            r#"#!/bin/sh
for arg in "$@"; do
	case "$arg" in
	tap,*)
		ifname="$(echo "$arg" | tr ',' '\n' | sed -n 's/^ifname=//p')"
		script="$(echo "$arg" | tr ',' '\n' | sed -n 's/^script=//p')"
		;;
	esac
done
sleep 0.5
PATH="{bin}:$PATH" "$script" "$ifname" > "{out}/$ifname.tmp" 2>&1
mv "{out}/$ifname.tmp" "{out}/$ifname"
exec sleep 30
"#,
            bin = bin.display(),
            out = out.display(),
        );
        std::fs::write(&self.hypervisor, hypervisor).unwrap();
        out
    }

    fn lifecycle(&self) -> TestLifecycle {
        Lifecycle::new(
            Registry::open(&self.root).unwrap(),
            ExecRunner::new(Duration::from_secs(5), Duration::from_secs(5)),
            MirrorPackageService::new(&self.mirror),
            StubEnvironment,
            LaunchSettings {
                hypervisor: self.hypervisor.display().to_string(),
                sudo: false,
            },
        )
    }
}

async fn read_when_written(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            return contents;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} was never written", path.display());
}

fn octets(records: &[RuntimeRecord]) -> Vec<u8> {
    let mut octets: Vec<u8> = records
        .iter()
        .flat_map(|r| r.network.iter().map(NetworkAllocation::octet))
        .collect();
    octets.sort();
    octets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_lifecycle_with_two_instances() {
    let fixture = Fixture::new();
    let mut lc = fixture.lifecycle();

    lc.pull("nginx").await.unwrap();
    assert_eq!(lc.state("nginx").unwrap(), ProjectState::Pulled);

    let first = lc.run("nginx").await.unwrap();
    let second = lc.run("nginx").await.unwrap();
    assert_eq!(first.network.ip, Ipv4Addr::new(10, 1, 2, 4));
    assert_eq!(first.network.gw, Ipv4Addr::new(10, 1, 2, 1));
    assert_eq!(second.network.ip, Ipv4Addr::new(10, 1, 3, 4));
    assert_ne!(first.network.mac, second.network.mac);

    let handles: Vec<ProcessHandle> = [first.handle, second.handle]
        .into_iter()
        .map(Option::unwrap)
        .collect();
    for handle in &handles {
        assert!(handle.detached);
        assert!(handle.is_alive());
    }

    let running = lc.ps().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].project_name, "nginx");
    assert_eq!(running[0].process, handles);
    assert_eq!(octets(&running), vec![2, 3]);
    assert_eq!(
        lc.state("nginx").unwrap(),
        ProjectState::Running { instances: 2 }
    );

    match lc.kill("nginx").await.unwrap() {
        KillOutcome::Stopped { stopped, failures } => {
            assert_eq!(stopped.len(), 2);
            assert!(failures.is_empty(), "{failures:?}");
        }
        KillOutcome::NotRunning => panic!("nginx should have been running"),
    }
    for handle in &handles {
        assert!(!handle.is_alive());
    }
    assert!(lc.ps().unwrap().is_empty());
    assert_eq!(lc.state("nginx").unwrap(), ProjectState::Pulled);
    assert!(matches!(
        lc.kill("nginx").await.unwrap(),
        KillOutcome::NotRunning
    ));

    // With nothing running the allocator starts over.
    let again = lc.run("nginx").await.unwrap();
    assert_eq!(again.network.octet(), 2);

    let project_root = lc.registry().project("nginx").unwrap().root().to_path_buf();
    assert!(matches!(
        lc.remove("nginx").await.unwrap(),
        KillOutcome::Stopped { .. }
    ));
    assert!(!project_root.exists());
    assert!(!again.handle.unwrap().is_alive());
    assert_eq!(lc.state("nginx").unwrap(), ProjectState::Absent);
}

#[tokio::test]
async fn instances_started_back_to_back_keep_their_own_gateway() {
    let fixture = Fixture::new();
    let out = fixture.capture_ifup();
    let mut lc = fixture.lifecycle();
    lc.pull("nginx").await.unwrap();

    let first = lc.run("nginx").await.unwrap();
    let second = lc.run("nginx").await.unwrap();

    for launch in [&first, &second] {
        let tap = launch.network.tap_name();
        let configured = read_when_written(&out.join(&tap)).await;
        assert!(
            configured.contains(&format!("ifconfig {tap} {} netmask", launch.network.gw)),
            "{tap}: {configured}"
        );
    }

    lc.kill("nginx").await.unwrap();
}

#[tokio::test]
async fn kill_from_a_later_invocation() {
    let fixture = Fixture::new();

    let handle = {
        let mut lc = fixture.lifecycle();
        lc.pull("nginx").await.unwrap();
        lc.run("nginx").await.unwrap().handle.unwrap()
    };

    // A fresh lifecycle knows the instance only through the ledger.
    let mut lc = fixture.lifecycle();
    assert_eq!(lc.ps().unwrap()[0].process, vec![handle]);

    let outcome = lc.kill("nginx").await.unwrap();
    assert!(matches!(outcome, KillOutcome::Stopped { ref failures, .. } if failures.is_empty()));
    assert!(handle.wait_for_exit(Duration::from_secs(5)).await);
    assert!(lc.ps().unwrap().is_empty());
}

#[tokio::test]
async fn remove_purges_even_when_not_running() {
    let fixture = Fixture::new();
    let mut lc = fixture.lifecycle();
    let project = lc.pull("nginx").await.unwrap();

    let outcome = lc.remove("nginx").await.unwrap();
    assert!(matches!(outcome, KillOutcome::NotRunning));
    assert!(!project.root().exists());
    assert!(lc.registry().project("nginx").is_none());
}

#[tokio::test]
async fn launch_failure_records_nothing() {
    let fixture = Fixture::new();
    let mut lc = Lifecycle::new(
        Registry::open(&fixture.root).unwrap(),
        ExecRunner::default(),
        MirrorPackageService::new(&fixture.mirror),
        StubEnvironment,
        LaunchSettings {
            hypervisor: fixture.root.join("missing-qemu").display().to_string(),
            sudo: false,
        },
    );
    lc.pull("nginx").await.unwrap();

    let err = lc.run("nginx").await.unwrap_err();
    assert!(matches!(err, virgo::Error::Spawn { .. }));
    assert!(err.to_string().contains("missing-qemu"));
    assert!(lc.ps().unwrap().is_empty());
}

#[tokio::test]
async fn stale_ledger_entries_are_pruned_on_next_run() {
    let fixture = Fixture::new();
    let mut lc = fixture.lifecycle();
    lc.pull("nginx").await.unwrap();

    // A ledger left behind by a crashed host: the pid is long gone.
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id() as i32;
    child.wait().unwrap();
    let ledger = vec![RuntimeRecord {
        project_name: "nginx".to_string(),
        process: vec![ProcessHandle::new(dead, true)],
        network: vec![NetworkAllocation {
            ip: Ipv4Addr::new(10, 1, 9, 4),
            gw: Ipv4Addr::new(10, 1, 9, 1),
            mac: "52:54:00:00:00:09".to_string(),
        }],
    }];
    std::fs::write(
        fixture.root.join("runtime.json"),
        serde_json::to_vec(&ledger).unwrap(),
    )
    .unwrap();

    assert!(lc.ps().unwrap().is_empty());
    assert_eq!(lc.state("nginx").unwrap(), ProjectState::Stopped);

    // The stale octet does not count as taken.
    let launch = lc.run("nginx").await.unwrap();
    assert_eq!(launch.network.octet(), 2);

    let store = RuntimeStore::open_at(
        &fixture.root.join("runtime.json"),
        &fixture.root.join("runtime.lock"),
        StoreMode::ReadOnly,
    )
    .unwrap();
    assert!(store.stale().is_empty());
    assert_eq!(store.records()[0].process, vec![launch.handle.unwrap()]);
    drop(store);

    lc.kill("nginx").await.unwrap();
}
