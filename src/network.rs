//! Network identity for new instances.
//!
//! Every instance lives on its own `/24`: `10.1.<n>.4` for the guest and
//! `10.1.<n>.1` for the host side of its tap device. The allocator picks
//! `n` one past the highest octet used by a live instance, so a fresh host
//! always starts at `10.1.2.x`.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::Project;

const NET_PREFIX: [u8; 2] = [10, 1];
/// Third octet of the first allocation.
pub const BASE_OCTET: u8 = 2;
/// Third octet reserved as the top of the range; never allocated.
pub const RESERVED_OCTET: u8 = 255;
const IP_HOST: u8 = 4;
const GW_HOST: u8 = 1;
/// Locally administered prefix conventionally used for QEMU guests.
const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Address triple assigned to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAllocation {
    pub ip: Ipv4Addr,
    pub gw: Ipv4Addr,
    pub mac: String,
}

impl NetworkAllocation {
    /// Allocate the next free pair and a fresh MAC.
    pub fn allocate<'a>(running: impl IntoIterator<Item = &'a NetworkAllocation>) -> Result<Self> {
        let (ip, gw) = next_allocation(running)?;
        Ok(Self {
            ip,
            gw,
            mac: generate_mac(),
        })
    }

    /// The allocator-controlled octet. Unique among live instances, so it
    /// doubles as the tap device index.
    pub fn octet(&self) -> u8 {
        self.ip.octets()[2]
    }

    pub fn tap_name(&self) -> String {
        format!("tap{}", self.octet())
    }
}

/// Compute the `(ip, gw)` pair for a new instance given the allocations of
/// every live instance.
pub fn next_allocation<'a>(
    running: impl IntoIterator<Item = &'a NetworkAllocation>,
) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let octet = match running.into_iter().map(NetworkAllocation::octet).max() {
        None => BASE_OCTET,
        Some(max) => {
            let next = max.checked_add(1).ok_or(Error::NetworkExhausted)?;
            if next >= RESERVED_OCTET {
                return Err(Error::NetworkExhausted);
            }
            next
        }
    };

    let [a, b] = NET_PREFIX;
    let ip = Ipv4Addr::new(a, b, octet, IP_HOST);
    let gw = Ipv4Addr::new(a, b, octet, GW_HOST);
    debug!(%ip, %gw, "network allocated");
    Ok((ip, gw))
}

/// Fixed QEMU prefix followed by three random octets from the OS CSPRNG.
/// Collisions are not checked.
pub fn generate_mac() -> String {
    let mut suffix = [0u8; 3];
    rand::rngs::OsRng.fill_bytes(&mut suffix);

    let mut mac = String::with_capacity(17);
    for (i, byte) in MAC_PREFIX.iter().chain(suffix.iter()).enumerate() {
        if i > 0 {
            mac.push(':');
        }
        let _ = write!(mac, "{byte:02x}");
    }
    mac
}

// ---------------------------------------------------------------------------
// Tap scripts
// ---------------------------------------------------------------------------

/// Script QEMU runs with the tap interface name as `$1` once the device
/// exists: assigns the gateway address and, on macOS, enables NAT.
///
/// Tap devices are named `tap<n>` after the allocated octet, so the gateway
/// `10.1.<n>.1` is recovered from `$1` and one script serves every instance
/// of a project.
pub fn ifup_script() -> String {
    let [a, b] = NET_PREFIX;
    format!(
        r#"#!/bin/sh
octet="${{1#tap}}"
case "$octet" in
	''|*[!0-9]*) echo "ifup: unexpected interface '$1'" >&2; exit 1 ;;
esac
sudo ifconfig "$1" {a}.{b}."$octet".{GW_HOST} netmask 255.255.255.0 up

if [ "$(uname)" = "Darwin" ]; then
	sudo pfctl -d
	rules="$(mktemp)"
	echo "nat on en0 from $1:network to any -> (en0)" > "$rules"
	sudo pfctl -f "$rules" -e
	rm -f "$rules"
fi
"#
    )
}

pub fn ifdown_script() -> &'static str {
    "#!/bin/sh\nsudo ifconfig \"$1\" down\n"
}

/// Write the project's `ifup.sh` / `ifdown.sh`. Their contents do not depend
/// on the allocation.
pub fn write_scripts(project: &Project) -> Result<()> {
    write_executable(&project.ifup_file(), ifup_script().as_bytes())?;
    write_executable(&project.ifdown_file(), ifdown_script().as_bytes())?;
    debug!(project = %project.name(), "network scripts written");
    Ok(())
}

fn write_executable(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, contents).map_err(|e| Error::io(path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(path, e))
}
