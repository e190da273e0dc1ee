//! Launching the hyperkit hypervisor process.
//!
//! The controller never manipulates the hypervisor child directly — it hands
//! a fully composed [`LaunchConfig`] to a [`Hypervisor`] and afterwards deals
//! only in pids read back from the state directory. The executor persists
//! both pid files itself: `hyperkit.pid` via hyperkit's own `-F` flag and the
//! JSON record the controller treats as the source of truth.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::machine::{self, MACHINE_FILENAME};

/// Everything the hypervisor needs to boot one machine.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Extracted kernel inside the state directory.
    pub kernel_path: PathBuf,
    /// Extracted initial ramdisk inside the state directory.
    pub initrd_path: PathBuf,
    /// Kernel options discovered from the boot image (or pre-configured).
    pub boot_cmdline: String,
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// Machine identity; the guest MAC derives from it on the vmnet side.
    pub uuid: String,
    /// Data disks, attached in order.
    pub disks: Vec<PathBuf>,
    /// ISO images, attached after the disks.
    pub iso_images: Vec<PathBuf>,
    /// File receiving the guest serial console.
    pub console_log: PathBuf,
    /// Attach the guest to the host NAT network.
    pub vmnet: bool,
    /// Machine state directory; the executor drops its pid files here.
    pub state_dir: PathBuf,
}

/// The hypervisor executor.
pub trait Hypervisor: Send + Sync {
    /// Launch the hypervisor for this machine. On success the pid record in
    /// the state directory identifies the new process.
    fn launch(&self, config: &LaunchConfig) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Real executor
// ---------------------------------------------------------------------------

/// Spawns the `hyperkit` binary.
pub struct HyperkitExec;

/// Resolve the `hyperkit` binary, honouring PATH before the fixed install
/// locations (Homebrew, Docker Desktop).
fn find_hyperkit() -> Result<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("hyperkit");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    let candidates: &[&str] = &[
        "/usr/local/bin/hyperkit",
        "/opt/homebrew/bin/hyperkit",
        "/Applications/Docker.app/Contents/Resources/bin/com.docker.hyperkit",
    ];

    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    bail!(
        "hyperkit binary not found. Install it with: brew install hyperkit\n\
         Or set PATH to include the directory containing hyperkit."
    )
}

/// Compose the hyperkit argument vector for `config`.
pub fn build_hyperkit_args(config: &LaunchConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    // ACPI and machine identity.
    args.push("-A".to_string());
    args.push("-U".to_string());
    args.push(config.uuid.clone());

    // Resources.
    args.push("-c".to_string());
    args.push(config.cpu_count.to_string());
    args.push("-m".to_string());
    args.push(format!("{}M", config.memory_mb));

    // Host bridge and LPC are fixed wiring.
    args.push("-s".to_string());
    args.push("0:0,hostbridge".to_string());
    args.push("-s".to_string());
    args.push("31,lpc".to_string());

    // Guest networking over vmnet.
    if config.vmnet {
        args.push("-s".to_string());
        args.push("2:0,virtio-net".to_string());
    }

    // Data disks, then ISO images, on consecutive slots.
    let mut slot = 4;
    for disk in &config.disks {
        args.push("-s".to_string());
        args.push(format!("{slot}:0,virtio-blk,{}", disk.display()));
        slot += 1;
    }
    for iso in &config.iso_images {
        args.push("-s".to_string());
        args.push(format!("{slot},ahci-cd,{}", iso.display()));
        slot += 1;
    }

    // Serial console on com1; the child's stdio is redirected into the
    // console sink at spawn time.
    args.push("-l".to_string());
    args.push("com1,stdio".to_string());

    // hyperkit writes its own pid file.
    args.push("-F".to_string());
    args.push(config.state_dir.join(machine::PID_FILENAME).display().to_string());

    // Direct kernel boot.
    args.push("-f".to_string());
    args.push(format!(
        "kexec,{},{},{}",
        config.kernel_path.display(),
        config.initrd_path.display(),
        config.boot_cmdline
    ));

    args
}

impl Hypervisor for HyperkitExec {
    fn launch(&self, config: &LaunchConfig) -> Result<()> {
        // Validate paths eagerly so callers get a clear error.
        if !config.kernel_path.exists() {
            bail!("kernel path does not exist: {}", config.kernel_path.display());
        }
        if !config.initrd_path.exists() {
            bail!("initrd path does not exist: {}", config.initrd_path.display());
        }
        for disk in &config.disks {
            if !disk.exists() {
                bail!("disk path does not exist: {}", disk.display());
            }
        }

        let hyperkit = find_hyperkit()?;
        info!(path = %hyperkit.display(), "found hyperkit binary");

        let console = std::fs::File::create(&config.console_log)
            .with_context(|| format!("create console sink {}", config.console_log.display()))?;
        let console_err = console
            .try_clone()
            .context("clone console sink for stderr")?;

        let child = std::process::Command::new(&hyperkit)
            .args(build_hyperkit_args(config))
            .stdin(std::process::Stdio::null())
            .stdout(console)
            .stderr(console_err)
            .spawn()
            .context("failed to spawn hyperkit process")?;

        let pid = child.id() as i32;
        info!(
            pid,
            uuid = %config.uuid,
            cpus = config.cpu_count,
            memory_mb = config.memory_mb,
            kernel = %config.kernel_path.display(),
            "hypervisor launched"
        );

        machine::write_pid_record(&config.state_dir.join(MACHINE_FILENAME), pid)
            .context("persist pid record")?;

        Ok(())
    }
}
