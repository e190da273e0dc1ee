//! Guest address resolution.
//!
//! hyperkit puts the guest on the host NAT network; the host's DHCP server
//! records the lease in `/var/db/dhcpd_leases`. The guest's MAC address is
//! derived deterministically from the machine UUID, so finding the guest IP
//! is a bounded poll of the lease table keyed by that MAC.
//!
//! The lease table stores hardware addresses with unpadded hex groups
//! (`ba:fd:e8:9c:4:1e`, not `ba:fd:e8:9c:04:1e`), so the derived MAC is
//! trimmed before lookup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::retry::{Retriable, retry_after};

/// Attempt budget for the mandatory wait during start.
const IP_WAIT_ATTEMPTS: u32 = 30;

/// Looser budget used before NFS setup, which additionally needs the guest
/// network stack to be up.
const IP_WAIT_ATTEMPTS_LONG: u32 = 60;

/// Fixed spacing between lease lookups.
const IP_WAIT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// MAC derivation
// ---------------------------------------------------------------------------

/// Derive the guest MAC address from the machine UUID.
///
/// SHA-256 over the canonical UUID string, truncated to six bytes, with the
/// first byte forced to a locally-administered unicast address. Stable for
/// the life of the machine: the same UUID always maps to the same MAC.
pub fn mac_from_uuid(uuid: &str) -> Result<String> {
    let parsed = uuid::Uuid::parse_str(uuid)
        .with_context(|| format!("machine uuid {uuid:?} is not a valid UUID"))?;

    let digest = Sha256::digest(parsed.to_string().as_bytes());
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] | 0x02) & 0xFE;

    Ok(octets.map(|b| format!("{b:02x}")).join(":"))
}

/// Strip leading zeros from each byte group of a MAC address, matching the
/// unpadded form the host lease table stores.
pub fn trim_mac_address(mac: &str) -> String {
    mac.split(':')
        .map(|group| {
            let trimmed = group.trim_start_matches('0');
            if trimmed.is_empty() { "0" } else { trimmed }
        })
        .collect::<Vec<_>>()
        .join(":")
}

// ---------------------------------------------------------------------------
// Lease source
// ---------------------------------------------------------------------------

/// Read access to the host DHCP lease state, keyed by hardware address.
pub trait LeaseSource: Send + Sync {
    /// The IP currently leased to `mac`, or `None` when no lease exists yet.
    fn lookup(&self, mac: &str) -> Result<Option<String>>;
}

/// The macOS lease file maintained by the vmnet DHCP server.
pub struct DhcpdLeases {
    path: PathBuf,
}

impl DhcpdLeases {
    pub fn new() -> Self {
        Self { path: PathBuf::from("/var/db/dhcpd_leases") }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DhcpdLeases {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseSource for DhcpdLeases {
    fn lookup(&self, mac: &str) -> Result<Option<String>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read lease file {}", self.path.display()))?;
        Ok(find_ip_in_leases(&content, mac))
    }
}

/// Scan dhcpd_leases content for an entry whose `hw_address` matches `mac`.
///
/// Entries are brace-delimited blocks of `key=value` lines; `hw_address`
/// carries a `1,` hardware-type prefix before the address itself.
pub fn find_ip_in_leases(content: &str, mac: &str) -> Option<String> {
    let mut ip: Option<&str> = None;
    let mut hw: Option<&str> = None;

    for line in content.lines() {
        let line = line.trim();
        if line == "{" {
            ip = None;
            hw = None;
        } else if line == "}" {
            if hw == Some(mac) {
                return ip.map(str::to_string);
            }
        } else if let Some(value) = line.strip_prefix("ip_address=") {
            ip = Some(value);
        } else if let Some(value) = line.strip_prefix("hw_address=") {
            hw = Some(value.split_once(',').map_or(value, |(_, addr)| addr));
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Bounded waits
// ---------------------------------------------------------------------------

/// One lease lookup. A missing lease (or an unreadable lease table — dhcpd
/// may not have started yet) is reported as retriable.
pub fn ip_for_mac(leases: &dyn LeaseSource, mac: &str) -> Result<String> {
    match leases.lookup(mac) {
        Ok(Some(ip)) => Ok(ip),
        Ok(None) => Err(anyhow::Error::new(Retriable(format!(
            "no lease found for MAC {mac}"
        )))),
        Err(e) => Err(anyhow::Error::new(Retriable(format!(
            "lease lookup for MAC {mac} failed: {e:#}"
        )))),
    }
}

/// Block until the lease table assigns an IP to `mac`, with the mandatory
/// start budget (30 attempts, 2 s apart). Exhaustion is a failed start, not
/// a condition to retry further.
pub async fn wait_for_ip(leases: &dyn LeaseSource, mac: &str) -> Result<String> {
    wait_for_ip_with(leases, mac, IP_WAIT_ATTEMPTS, IP_WAIT_DELAY).await
}

/// Like [`wait_for_ip`] with the looser 60-attempt budget, used when NFS
/// setup additionally requires a live guest network stack.
pub async fn wait_for_ip_long(leases: &dyn LeaseSource, mac: &str) -> Result<String> {
    wait_for_ip_with(leases, mac, IP_WAIT_ATTEMPTS_LONG, IP_WAIT_DELAY).await
}

/// Budget-parameterised wait; the public entry points fix the budgets.
pub async fn wait_for_ip_with(
    leases: &dyn LeaseSource,
    mac: &str,
    attempts: u32,
    delay: Duration,
) -> Result<String> {
    debug!(mac, attempts, "waiting for DHCP lease");
    let ip = retry_after(attempts, delay, || async move { ip_for_mac(leases, mac) })
        .await
        .with_context(|| format!("IP address never found in dhcp leases file for MAC {mac}"))?;
    info!(mac, ip = %ip, "resolved guest IP");
    Ok(ip)
}

// ---------------------------------------------------------------------------
// Host-side address
// ---------------------------------------------------------------------------

/// The host's address on the vmnet shared network, used as the NFS server
/// address in the guest mount script.
pub async fn host_net_addr() -> Result<String> {
    let output = tokio::process::Command::new("defaults")
        .args([
            "read",
            "/Library/Preferences/SystemConfiguration/com.apple.vmnet",
            "Shared_Net_Address",
        ])
        .output()
        .await
        .context("spawn `defaults` to read vmnet Shared_Net_Address")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("reading vmnet Shared_Net_Address failed: {}", stderr.trim());
    }

    let addr = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if addr.is_empty() {
        bail!("vmnet Shared_Net_Address is empty — is the vmnet network configured?");
    }
    Ok(addr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
