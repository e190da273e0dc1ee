//! Machine description and on-disk state layout.
//!
//! A machine is described once by a [`MachineSpec`] and owns one state
//! directory for its whole life. Everything the controller persists lives in
//! that directory:
//!
//! ```text
//! <state_dir>/
//!     config.json        serialised MachineSpec
//!     hyperkit.json      pid record written by the hypervisor executor
//!     hyperkit.pid       hypervisor-internal pid file (plain integer)
//!     boot.iso           copy of the source boot image
//!     boot-image/        transient mount point while extracting artifacts
//!     vmlinuz… initrd…   extracted boot artifacts
//!     console.log        guest serial console sink
//!     <name>.rawdisk     data disk
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name of the boot image copy inside the state directory.
pub const ISO_FILENAME: &str = "boot.iso";

/// Transient mount point directory used while the boot image is attached.
pub const ISO_MOUNT_DIR: &str = "boot-image";

/// The hypervisor's own pid file — the secondary unclean-shutdown signal.
pub const PID_FILENAME: &str = "hyperkit.pid";

/// JSON pid record — the single source of truth for a previous run's pid.
pub const MACHINE_FILENAME: &str = "hyperkit.json";

/// Serialised [`MachineSpec`].
pub const CONFIG_FILENAME: &str = "config.json";

/// Guest serial console output.
pub const CONSOLE_FILENAME: &str = "console.log";

/// Remote user the guest image accepts over ssh.
pub const DEFAULT_SSH_USER: &str = "docker";

// ---------------------------------------------------------------------------
// MachineSpec
// ---------------------------------------------------------------------------

/// The immutable-once-created description of a machine.
///
/// Created by the provisioning tool at machine-creation time. The only later
/// mutation is boot-artifact extraction filling in `boot_cmdline`, `vmlinuz`
/// and `initrd`; nothing changes after the first successful start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Stable machine name; also names the data disk file.
    pub machine_name: String,

    /// Number of virtual CPUs.
    pub cpu_count: u32,

    /// Memory allocation in megabytes.
    pub memory_mb: u32,

    /// Data disk size in megabytes.
    pub disk_size_mb: u64,

    /// Stable machine identity; the guest MAC address derives from it.
    pub uuid: String,

    /// Kernel boot options. `None` until discovered from the boot image's
    /// bootloader configuration.
    pub boot_cmdline: Option<String>,

    /// Base name of the extracted kernel inside the state directory.
    pub vmlinuz: Option<String>,

    /// Base name of the extracted initial ramdisk inside the state directory.
    pub initrd: Option<String>,

    /// Host directories exported to the guest over NFS. Entries that are not
    /// absolute are resolved against the state directory.
    pub nfs_shares: Vec<String>,

    /// Mount root inside the guest under which each share is mounted.
    pub nfs_shares_root: String,

    /// Remote login identity for the guest-side mount script.
    pub ssh_user: String,

    /// Source boot image copied into the state directory at create time.
    /// `None` when the image has already been placed there by other means.
    pub boot_image: Option<PathBuf>,
}

impl MachineSpec {
    /// A spec with the stock resource defaults and a fresh UUID.
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            cpu_count: 2,
            memory_mb: 6000,
            disk_size_mb: 20000,
            uuid: uuid::Uuid::new_v4().to_string(),
            boot_cmdline: None,
            vmlinuz: None,
            initrd: None,
            nfs_shares: Vec::new(),
            nfs_shares_root: "/nfsshares".to_string(),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            boot_image: None,
        }
    }

    /// Persist the spec as `config.json` in the state directory.
    pub fn save(&self, paths: &MachinePaths) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serialise machine config")?;
        std::fs::write(&paths.config_file, json)
            .with_context(|| format!("write {}", paths.config_file.display()))?;
        Ok(())
    }

    /// Load a previously saved spec from `config.json`.
    pub fn load(paths: &MachinePaths) -> Result<Self> {
        let json = std::fs::read_to_string(&paths.config_file)
            .with_context(|| format!("read {}", paths.config_file.display()))?;
        serde_json::from_str(&json).context("parse machine config")
    }
}

// ---------------------------------------------------------------------------
// MachinePaths
// ---------------------------------------------------------------------------

/// All resolved per-machine file locations.
///
/// The driver composes this explicitly instead of mixing path helpers into
/// its own fields, so everything that touches the state directory goes
/// through one component.
#[derive(Debug, Clone)]
pub struct MachinePaths {
    /// The machine-scoped state directory root.
    pub state_dir: PathBuf,
    /// Boot image copy: `boot.iso`.
    pub boot_iso: PathBuf,
    /// Transient image mount point: `boot-image/`.
    pub iso_mount: PathBuf,
    /// Hypervisor-internal pid file: `hyperkit.pid`.
    pub pid_file: PathBuf,
    /// JSON pid record: `hyperkit.json`.
    pub machine_file: PathBuf,
    /// Serialised spec: `config.json`.
    pub config_file: PathBuf,
    /// Serial console sink: `console.log`.
    pub console_log: PathBuf,
    /// Data disk: `<machine_name>.rawdisk`.
    pub raw_disk: PathBuf,
}

impl MachinePaths {
    /// Resolve all file locations under `state_dir` for `machine_name`.
    /// Does not create anything — call [`MachinePaths::ensure`] for that.
    pub fn new(state_dir: impl Into<PathBuf>, machine_name: &str) -> Self {
        let state_dir = state_dir.into();
        Self {
            boot_iso: state_dir.join(ISO_FILENAME),
            iso_mount: state_dir.join(ISO_MOUNT_DIR),
            pid_file: state_dir.join(PID_FILENAME),
            machine_file: state_dir.join(MACHINE_FILENAME),
            config_file: state_dir.join(CONFIG_FILENAME),
            console_log: state_dir.join(CONSOLE_FILENAME),
            raw_disk: state_dir.join(format!("{machine_name}.rawdisk")),
            state_dir,
        }
    }

    /// Resolve an arbitrary file name inside the state directory.
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    /// Create the state directory if it does not already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)
    }
}

// ---------------------------------------------------------------------------
// Pid record
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct PidRecord {
    pid: i32,
}

/// Read the pid out of the JSON pid record.
///
/// Any read or parse failure is logged and reported as pid 0 — "no previous
/// run". Callers distinguish a live machine by probing the pid, not by the
/// presence of this file.
pub fn read_pid_record(path: &Path) -> i32 {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error reading pid record");
            return 0;
        }
    };

    match serde_json::from_str::<PidRecord>(&json) {
        Ok(record) => record.pid,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error decoding pid record");
            0
        }
    }
}

/// Write the JSON pid record. Used by the hypervisor executor after launch.
pub fn write_pid_record(path: &Path, pid: i32) -> Result<()> {
    let json = serde_json::to_string(&PidRecord { pid })?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// VmState
// ---------------------------------------------------------------------------

/// Observed lifecycle state of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// No associated hypervisor process is running.
    Stopped,
    /// A live hypervisor process matches the pid record.
    Running,
    /// The liveness probe itself failed; distinct from `Stopped`.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec = MachineSpec::new("default");
        assert_eq!(spec.cpu_count, 2);
        assert_eq!(spec.memory_mb, 6000);
        assert_eq!(spec.disk_size_mb, 20000);
        assert_eq!(spec.ssh_user, "docker");
        assert!(spec.nfs_shares.is_empty());
        assert!(spec.boot_cmdline.is_none());
        // UUID must parse back.
        uuid::Uuid::parse_str(&spec.uuid).expect("valid v4 uuid");
    }

    #[test]
    fn paths_layout() {
        let paths = MachinePaths::new("/var/machines/default", "default");
        assert_eq!(paths.pid_file, Path::new("/var/machines/default/hyperkit.pid"));
        assert_eq!(paths.machine_file, Path::new("/var/machines/default/hyperkit.json"));
        assert_eq!(paths.raw_disk, Path::new("/var/machines/default/default.rawdisk"));
        assert_eq!(paths.resolve("vmlinuz64"), Path::new("/var/machines/default/vmlinuz64"));
    }

    #[test]
    fn pid_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MACHINE_FILENAME);

        write_pid_record(&path, 4242).unwrap();
        assert_eq!(read_pid_record(&path), 4242);
    }

    #[test]
    fn missing_pid_record_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_pid_record(&dir.path().join(MACHINE_FILENAME)), 0);
    }

    #[test]
    fn garbage_pid_record_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MACHINE_FILENAME);
        std::fs::write(&path, "not json at all").unwrap();
        assert_eq!(read_pid_record(&path), 0);
    }

    #[test]
    fn spec_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MachinePaths::new(dir.path(), "roundtrip");

        let mut spec = MachineSpec::new("roundtrip");
        spec.boot_cmdline = Some("loglevel=3 console=ttyS0".to_string());
        spec.nfs_shares = vec!["/Users/shared".to_string()];
        spec.save(&paths).unwrap();

        let loaded = MachineSpec::load(&paths).unwrap();
        assert_eq!(loaded.machine_name, "roundtrip");
        assert_eq!(loaded.boot_cmdline.as_deref(), Some("loglevel=3 console=ttyS0"));
        assert_eq!(loaded.nfs_shares, vec!["/Users/shared".to_string()]);
        assert_eq!(loaded.uuid, spec.uuid);
    }
}
