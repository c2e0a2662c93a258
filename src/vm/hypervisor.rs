//! QEMU command-line assembly.
//!
//! ```text
//! [sudo] qemu-system-x86_64 <accel>
//!     -drive if=virtio,file=<volumes>/vol<id>,format=raw      (per volume)
//!     -nographic -vga none -serial file:<logs>/console-<n>.log -m <mem>
//!     -netdev tap,id=net<n>,ifname=tap<n>,script=ifup.sh,downscript=ifdown.sh
//!     -device virtio-net-pci,netdev=net<n>,mac=<mac>
//!     -kernel <image> -append <rumprun config>   |   -hda <image>
//! ```
//!
//! `<n>` is the instance's allocated third octet, so concurrent instances
//! never share a tap device or a console log.

use serde_json::Value;

use super::LaunchSettings;
use crate::manifest::ProcessSpec;
use crate::network::NetworkAllocation;
use crate::registry::Project;

/// Hardware acceleration available to the hypervisor on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    /// Linux with `vmx` or `svm` CPU flags.
    Kvm,
    /// macOS with the HAXM kernel extension loaded.
    Hax,
    /// Any other OS: acceleration explicitly disabled.
    NoKvm,
    /// Supported OS without usable acceleration.
    None,
}

impl Acceleration {
    pub fn flags(self) -> Vec<String> {
        match self {
            Self::Kvm => vec!["-enable-kvm".to_string()],
            Self::Hax => vec!["-accel".to_string(), "hax".to_string()],
            Self::NoKvm => vec!["-no-kvm".to_string()],
            Self::None => Vec::new(),
        }
    }
}

/// Rumprun JSON configuration passed through `-append`.
///
/// QEMU splits multiboot command lines on commas, so every comma is doubled.
/// Keys repeat (`env`, `blk`) the way rumprun expects, which is why this is
/// assembled by hand rather than through a JSON map.
pub fn append_payload(spec: &ProcessSpec, network: &NetworkAllocation) -> String {
    let mut entries = vec![format!(
        r#""net": {{"if": "vioif0", "type": "inet", "method": "static", "addr": {}, "mask": "24", "gw": {}}}"#,
        quote(&network.ip.to_string()),
        quote(&network.gw.to_string()),
    )];

    entries.extend(spec.env_tokens().map(|token| format!(r#""env": {}"#, quote(token))));

    entries.extend(spec.volumes.iter().enumerate().map(|(i, volume)| {
        format!(
            r#""blk": {{"source": "dev", "path": "/dev/ld{i}a", "fstype": "blk", "mountpoint": {}}}"#,
            quote(&volume.mount_path)
        )
    }));

    entries.push(format!(r#""cmdline": {}"#, quote(&spec.cmdline)));

    format!("{{{}}}", entries.join(", ")).replace(',', ",,")
}

fn quote(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/// One `-drive` per volume of `spec`, in manifest order.
pub fn drive_args(project: &Project, spec: &ProcessSpec) -> Vec<String> {
    spec.volumes
        .iter()
        .flat_map(|volume| {
            [
                "-drive".to_string(),
                format!(
                    "if=virtio,file={},format=raw",
                    project.volume_file(volume.id).display()
                ),
            ]
        })
        .collect()
}

/// Boot directive: kernel plus append line for multiboot images, raw disk
/// otherwise.
pub fn boot_args(project: &Project, spec: &ProcessSpec, network: &NetworkAllocation) -> Vec<String> {
    let image = project.kernel_file().display().to_string();
    if spec.multiboot {
        vec![
            "-kernel".to_string(),
            image,
            "-append".to_string(),
            append_payload(spec, network),
        ]
    } else {
        vec!["-hda".to_string(), image]
    }
}

fn network_args(project: &Project, network: &NetworkAllocation) -> Vec<String> {
    let n = network.octet();
    vec![
        "-netdev".to_string(),
        format!(
            "tap,id=net{n},ifname={},script={},downscript={}",
            network.tap_name(),
            project.ifup_file().display(),
            project.ifdown_file().display()
        ),
        "-device".to_string(),
        format!("virtio-net-pci,netdev=net{n},mac={}", network.mac),
    ]
}

/// Hypervisor arguments (without the binary) for one instance.
pub fn hypervisor_args(
    project: &Project,
    spec: &ProcessSpec,
    network: &NetworkAllocation,
    acceleration: Acceleration,
) -> Vec<String> {
    let mut args = acceleration.flags();
    args.extend(drive_args(project, spec));
    args.extend([
        "-nographic".to_string(),
        "-vga".to_string(),
        "none".to_string(),
        "-serial".to_string(),
        format!("file:{}", project.console_log(network.octet()).display()),
        "-m".to_string(),
        spec.memory.to_string(),
    ]);
    args.extend(network_args(project, network));
    args.extend(boot_args(project, spec, network));
    args
}

/// Full `(program, args)` to launch one instance.
pub fn launch_command(
    settings: &LaunchSettings,
    project: &Project,
    spec: &ProcessSpec,
    network: &NetworkAllocation,
    acceleration: Acceleration,
) -> (String, Vec<String>) {
    settings.privileged(
        &settings.hypervisor,
        hypervisor_args(project, spec, network, acceleration),
    )
}
