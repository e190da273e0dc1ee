//! The machine lifecycle controller.
//!
//! [`HyperkitDriver`] sequences everything the surrounding provisioning tool
//! asks for: `create`, `start`, `stop`, `kill`, `remove`, `restart` and
//! `state`. It owns one machine's state directory and reaches all external
//! state (hypervisor executor, process table, DHCP leases, NFS export
//! registry, remote command channel, image mounter, disk utilities) through
//! the collaborator traits, so the full lifecycle is drivable in tests.
//!
//! Operations on one machine are strictly sequential: each runs to
//! completion before returning. Concurrent `start` calls against the same
//! state directory are not guarded and are undefined behaviour — the caller
//! is expected to serialise per machine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::bootimage::{self, Hdiutil, ImageMounter};
use crate::hypervisor::{Hypervisor, HyperkitExec, LaunchConfig};
use crate::machine::{MachinePaths, MachineSpec, VmState, read_pid_record};
use crate::network::{self, DhcpdLeases, LeaseSource, mac_from_uuid, trim_mac_address};
use crate::nfs::{self, EtcExports, ExportRegistry, RemoteRunner, SshRunner};
use crate::process::{ProcHandle, ProcessProbe, SysinfoProbe, pid_state};

// ---------------------------------------------------------------------------
// Disk provisioning
// ---------------------------------------------------------------------------

/// Prepares the machine's disk artifacts at create time: the boot image copy
/// and the sparse data disk. Actual image building lives outside this crate.
pub trait DiskProvisioner: Send + Sync {
    fn prepare(&self, spec: &MachineSpec, paths: &MachinePaths) -> Result<()>;
}

/// Default provisioner: copies the configured boot image into the state
/// directory and creates a sparse raw data disk.
pub struct SparseDisk;

impl DiskProvisioner for SparseDisk {
    fn prepare(&self, spec: &MachineSpec, paths: &MachinePaths) -> Result<()> {
        if let Some(src) = &spec.boot_image {
            std::fs::copy(src, &paths.boot_iso).with_context(|| {
                format!("copy boot image {} into state directory", src.display())
            })?;
        }

        if !paths.raw_disk.exists() {
            create_sparse_disk(&paths.raw_disk, spec.disk_size_mb)?;
        }
        Ok(())
    }
}

/// Create a blank sparse raw disk image at `path` with size `size_mb`
/// megabytes. The file only consumes real blocks once the guest writes.
fn create_sparse_disk(path: &Path, size_mb: u64) -> Result<()> {
    let size_arg = format!("{size_mb}M");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }

    let output = std::process::Command::new("truncate")
        .args(["-s", &size_arg, &path.to_string_lossy()])
        .output()
        .context("spawn `truncate`")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("truncate failed (exit {}): {}", output.status, stderr.trim());
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// External state the driver operates through, overridable in tests.
pub struct Collaborators {
    pub hypervisor: Box<dyn Hypervisor>,
    pub leases: Box<dyn LeaseSource>,
    pub exports: Box<dyn ExportRegistry>,
    pub remote: Box<dyn RemoteRunner>,
    pub probe: Box<dyn ProcessProbe>,
    pub mounter: Box<dyn ImageMounter>,
    pub disk: Box<dyn DiskProvisioner>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            hypervisor: Box::new(HyperkitExec),
            leases: Box::new(DhcpdLeases::new()),
            exports: Box::new(EtcExports::new()),
            remote: Box::new(SshRunner),
            probe: Box::new(SysinfoProbe),
            mounter: Box::new(Hdiutil),
            disk: Box::new(SparseDisk),
        }
    }
}

/// Lifecycle controller for one hyperkit machine.
pub struct HyperkitDriver {
    spec: MachineSpec,
    paths: MachinePaths,
    ip_address: Option<String>,
    ext: Collaborators,
}

impl HyperkitDriver {
    /// A driver over the real host collaborators.
    pub fn new(spec: MachineSpec, state_dir: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(spec, state_dir, Collaborators::default())
    }

    /// A driver with explicit collaborators; the seam the tests use.
    pub fn with_collaborators(
        spec: MachineSpec,
        state_dir: impl Into<PathBuf>,
        ext: Collaborators,
    ) -> Self {
        let paths = MachinePaths::new(state_dir, &spec.machine_name);
        Self { spec, paths, ip_address: None, ext }
    }

    pub fn driver_name(&self) -> &'static str {
        "hyperkit"
    }

    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    pub fn paths(&self) -> &MachinePaths {
        &self.paths
    }

    /// The guest IP resolved by the last successful start.
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn ssh_username(&self) -> &str {
        &self.spec.ssh_user
    }

    /// Hostname for ssh access — the resolved guest IP.
    pub fn ssh_hostname(&self) -> Result<&str> {
        self.ip_address
            .as_deref()
            .context("machine has no IP address yet — is it running?")
    }

    /// Docker-compatible endpoint URL for the running machine.
    pub fn url(&self) -> Result<String> {
        Ok(format!("tcp://{}:2376", self.ssh_hostname()?))
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Launching hyperkit's vmnet networking requires elevated privileges;
    /// checked before any side effect.
    pub fn pre_create_check(&self) -> Result<()> {
        if unsafe { libc::geteuid() } == 0 {
            return Ok(());
        }

        let exe = std::env::current_exe().context("resolve current executable")?;
        let name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "this tool".to_string());
        bail!(
            "{name} needs to run with elevated permissions. \
             Please run the following command, then try again: \
             sudo chown root:wheel {exe} && sudo chmod u+s {exe}",
            exe = exe.display()
        )
    }

    /// Provision disk artifacts, extract the boot artifacts out of the boot
    /// image, persist the updated spec, then start the machine.
    pub async fn create(&mut self) -> Result<()> {
        self.pre_create_check()?;
        self.paths.ensure().context("create machine state directory")?;

        self.ext
            .disk
            .prepare(&self.spec, &self.paths)
            .context("making disk image")?;

        bootimage::extract_boot_artifacts(&mut self.spec, &self.paths, &*self.ext.mounter)?;
        self.spec.save(&self.paths)?;

        self.start().await
    }

    /// Start the machine: recover any unclean shutdown, launch the
    /// hypervisor, and wait for the guest to acquire an IP. When NFS shares
    /// are configured, additionally wait for the guest network stack and
    /// export/mount the shares.
    ///
    /// Either returns with the machine fully running and an IP resolved, or
    /// fails without leaving a process attached to the pid record.
    pub async fn start(&mut self) -> Result<()> {
        self.recover_from_unclean_shutdown()?;

        let kernel = self
            .spec
            .vmlinuz
            .as_deref()
            .context("no kernel extracted for this machine — create it first")?;
        let initrd = self
            .spec
            .initrd
            .as_deref()
            .context("no initrd extracted for this machine — create it first")?;
        let cmdline = self.spec.boot_cmdline.clone().unwrap_or_default();

        let config = LaunchConfig {
            kernel_path: self.paths.resolve(kernel),
            initrd_path: self.paths.resolve(initrd),
            boot_cmdline: cmdline.clone(),
            cpu_count: self.spec.cpu_count,
            memory_mb: self.spec.memory_mb,
            uuid: self.spec.uuid.clone(),
            disks: vec![self.paths.raw_disk.clone()],
            iso_images: vec![self.paths.boot_iso.clone()],
            console_log: self.paths.console_log.clone(),
            vmnet: true,
            state_dir: self.paths.state_dir.clone(),
        };

        info!(uuid = %self.spec.uuid, "using machine UUID");
        let mac = trim_mac_address(&mac_from_uuid(&self.spec.uuid)?);
        info!(mac = %mac, "generated MAC address");
        info!(cmdline = %cmdline, "starting with kernel options");

        self.ext.hypervisor.launch(&config)?;

        let ip = network::wait_for_ip(&*self.ext.leases, &mac).await?;
        self.ip_address = Some(ip);

        if !self.spec.nfs_shares.is_empty() {
            info!("setting up NFS mounts");

            // ssh and nfsd need the guest network stack, which can lag the
            // DHCP lease; wait again with the looser budget.
            let ip = network::wait_for_ip_long(&*self.ext.leases, &mac).await?;
            nfs::wait_for_remote(&*self.ext.remote, &self.spec.ssh_user, &ip).await?;

            let host_ip = network::host_net_addr().await?;
            let map_user = current_username()?;
            nfs::setup_shares(
                &self.spec,
                &self.paths,
                &ip,
                &host_ip,
                &map_user,
                &*self.ext.exports,
                &*self.ext.remote,
            )?;
            self.ip_address = Some(ip);
        }

        Ok(())
    }

    /// Graceful stop: NFS teardown first (the export identifiers and guest
    /// IP must still be derivable), then SIGTERM to the supervised process.
    pub fn stop(&self) -> Result<()> {
        nfs::teardown_shares(&self.spec, &self.paths, &*self.ext.exports);
        self.proc_handle().terminate(true)
    }

    /// Forceful stop: immediate termination, bypassing export teardown.
    pub fn kill(&self) -> Result<()> {
        self.proc_handle().terminate(false)
    }

    /// Ensure no process remains before the provisioning tool discards the
    /// machine. Never erases on-disk artifacts. A failing state probe is
    /// logged and removal proceeds best-effort.
    pub fn remove(&self) -> Result<()> {
        match self.state() {
            VmState::Running => self.stop().context("stopping machine for removal")?,
            VmState::Error(e) => {
                info!(error = %e, "error checking machine status, assuming it has been removed already");
            }
            VmState::Stopped => {}
        }
        Ok(())
    }

    /// Graceful stop followed by a fresh start.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop()?;
        self.start().await
    }

    /// Current machine state, classified from the pid record and the
    /// process table. A probe failure is an explicit `Error`, never silently
    /// treated as stopped.
    pub fn state(&self) -> VmState {
        let pid = self.get_pid();
        match pid_state(&*self.ext.probe, pid) {
            Ok(state) => state,
            Err(e) => VmState::Error(format!("{e:#}")),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Pid from the JSON record; 0 when no previous run exists.
    fn get_pid(&self) -> i32 {
        read_pid_record(&self.paths.machine_file)
    }

    fn proc_handle(&self) -> ProcHandle {
        ProcHandle::new(self.get_pid())
    }

    /// Reconcile state left behind by a previous run before launching.
    ///
    /// The hypervisor's own pid file still existing means either an unclean
    /// shutdown (stale file — delete it and continue) or an instance that is
    /// actually still running (accept it and continue; the caller reconnects
    /// rather than double-launching). Any parse, probe or delete failure is
    /// terminal for the start: launching on top of unreconciled state risks
    /// two hypervisors on one state directory.
    pub fn recover_from_unclean_shutdown(&self) -> Result<()> {
        let pid_file = &self.paths.pid_file;

        match std::fs::metadata(pid_file) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %pid_file.display(), "clean start, hypervisor pid file doesn't exist");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("stat {}", pid_file.display())),
            Ok(_) => {}
        }

        warn!(
            file = %pid_file.display(),
            "hypervisor pid file still exists — machine may have shut down uncleanly"
        );

        let content = std::fs::read_to_string(pid_file)
            .with_context(|| format!("reading pid file {}", pid_file.display()))?;
        let pid: i32 = content
            .trim()
            .parse()
            .with_context(|| format!("parsing pid file {}", pid_file.display()))?;

        let state = pid_state(&*self.ext.probe, pid)?;
        debug!(pid, state = ?state, "probed recorded hypervisor pid");

        if state == VmState::Running {
            // A live instance: this is a restart reconnect, not a conflict.
            return Ok(());
        }

        debug!(file = %pid_file.display(), "removing stale pid file");
        std::fs::remove_file(pid_file)
            .with_context(|| format!("removing pid file {}", pid_file.display()))?;
        Ok(())
    }
}

/// The host user that NFS exports map the guest's accesses to.
fn current_username() -> Result<String> {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return Ok(user);
        }
    }

    let output = std::process::Command::new("id")
        .arg("-un")
        .output()
        .context("resolve current user via `id -un`")?;
    let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if user.is_empty() {
        bail!("could not determine the current username for NFS export mapping");
    }
    Ok(user)
}
