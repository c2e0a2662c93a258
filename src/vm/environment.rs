//! Host checks and host network plumbing around a launch.

use tracing::{debug, info, warn};

use super::LaunchSettings;
use super::hypervisor::Acceleration;
use crate::error::{Error, Result};
use crate::runner::Runner;

/// macOS releases virgo has been tested on.
pub const SUPPORTED_DARWIN: &[&str] = &[
    "10.11.4", "10.11.5", "10.11.6", "10.12", "10.12.2", "10.12.3", "10.12.6", "10.13.1",
    "10.13.3",
];

/// macOS releases whose packet filter needs `net.inet.ip.fw.enable=1`.
pub const DARWIN_FW: &[&str] = &["10.11.4", "10.11.5", "10.11.6"];

/// Result of a successful preflight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preflight {
    /// `sw_vers -productVersion` on macOS.
    pub os_version: Option<String>,
    pub needs_firewall_workaround: bool,
}

/// What the lifecycle needs to know about (and do to) the host.
#[allow(async_fn_in_trait)]
pub trait EnvironmentChecker {
    /// Check that the host can run instances at all.
    async fn preflight(&self) -> Result<Preflight>;

    /// Acceleration to request from the hypervisor.
    async fn has_acceleration(&self) -> Acceleration;

    /// Post-launch plumbing so the guest network is reachable.
    async fn enable_forwarding(&self, preflight: &Preflight) -> Result<()>;
}

/// [`EnvironmentChecker`] that probes the local machine through a runner.
#[derive(Debug)]
pub struct HostEnvironment<R: Runner> {
    runner: R,
    settings: LaunchSettings,
}

impl<R: Runner> HostEnvironment<R> {
    pub fn new(runner: R, settings: LaunchSettings) -> Self {
        Self { runner, settings }
    }

    async fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let out = self.runner.run(program, &args).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn has_hypervisor(&self) -> bool {
        self.output("which", &[self.settings.hypervisor.as_str()])
            .await
            .is_ok()
    }

    /// Whether a loaded kernel extension matches `needle`. `None` when
    /// `kextstat` printed nothing to inspect (a dry run).
    async fn kext_loaded(&self, needle: &str) -> Option<bool> {
        match self.output("kextstat", &[]).await {
            Ok(out) if out.is_empty() => None,
            Ok(out) => Some(out.lines().any(|line| line.contains(needle))),
            Err(e) => {
                debug!(error = %e, "kextstat failed");
                Some(false)
            }
        }
    }

    async fn sysctl(&self, setting: &str) -> Result<()> {
        let (program, args) = self
            .settings
            .privileged("sysctl", vec!["-w".to_string(), setting.to_string()]);
        self.runner.run(&program, &args).await?;
        info!(setting, "sysctl applied");
        Ok(())
    }

    async fn darwin_version(&self) -> Result<Preflight> {
        let version = self.output("sw_vers", &["-productVersion"]).await?;
        if version.is_empty() {
            // Nothing to compare against, e.g. under a dry run.
            return Ok(Preflight::default());
        }
        if !SUPPORTED_DARWIN.contains(&version.as_str()) {
            warn!(
                %version,
                tested = %SUPPORTED_DARWIN.join(", "),
                "untested macOS version; pfctl is used, earlier releases may need natd"
            );
        }
        Ok(Preflight {
            needs_firewall_workaround: DARWIN_FW.contains(&version.as_str()),
            os_version: Some(version),
        })
    }
}

impl<R: Runner> EnvironmentChecker for HostEnvironment<R> {
    async fn preflight(&self) -> Result<Preflight> {
        let preflight = if cfg!(target_os = "macos") {
            self.darwin_version().await?
        } else {
            Preflight::default()
        };

        if !self.has_hypervisor().await {
            return Err(Error::HypervisorMissing {
                binary: self.settings.hypervisor.clone(),
            });
        }

        if cfg!(target_os = "macos") && self.kext_loaded("tap").await == Some(false) {
            return Err(Error::TunTapMissing);
        }

        debug!(?preflight, "preflight passed");
        Ok(preflight)
    }

    async fn has_acceleration(&self) -> Acceleration {
        if cfg!(target_os = "linux") {
            match tokio::fs::read_to_string("/proc/cpuinfo").await {
                Ok(cpuinfo) if cpu_supports_kvm(&cpuinfo) => Acceleration::Kvm,
                Ok(_) => Acceleration::None,
                Err(e) => {
                    warn!(error = %e, "unable to read /proc/cpuinfo");
                    Acceleration::None
                }
            }
        } else if cfg!(target_os = "macos") {
            if self.kext_loaded("hax").await == Some(true) {
                info!("hax is enabled");
                Acceleration::Hax
            } else {
                Acceleration::None
            }
        } else {
            Acceleration::NoKvm
        }
    }

    async fn enable_forwarding(&self, preflight: &Preflight) -> Result<()> {
        if cfg!(target_os = "macos") {
            self.sysctl("net.inet.ip.forwarding=1").await?;
            self.sysctl("net.link.ether.inet.proxyall=1").await?;
            if preflight.needs_firewall_workaround {
                self.sysctl("net.inet.ip.fw.enable=1").await?;
            }
        } else if cfg!(target_os = "linux") {
            self.sysctl("net.ipv4.ip_forward=1").await?;
        }
        Ok(())
    }
}

/// `vmx` (Intel VT-x) or `svm` (AMD-V) in any `flags` line.
pub fn cpu_supports_kvm(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .flat_map(|line| line.split_whitespace())
        .any(|flag| flag == "vmx" || flag == "svm")
}
