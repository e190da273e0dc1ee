//! NFS shared folders between host and guest.
//!
//! Each configured share becomes one export entry scoped to the guest's IP,
//! registered under a stable per-machine, per-share identifier so it can be
//! found and removed again on stop. After registering the batch the export
//! daemon is reloaded once, and a single mount script is pushed into the
//! guest over the remote command channel.
//!
//! Teardown runs at the start of `stop`, before the termination signal is
//! sent — the guest IP and identifiers must still be derivable while the
//! exports are being removed.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info};

use crate::machine::{MachinePaths, MachineSpec};
use crate::retry::{Retriable, retry_after};

/// Substring the export registry reports when a new entry's scope collides
/// with an existing export. Collisions are non-fatal per share.
const CONFLICT_MARKER: &str = "conflicts with existing export";

// ---------------------------------------------------------------------------
// Export registry
// ---------------------------------------------------------------------------

/// Mutable access to the host's NFS export table and its daemon.
pub trait ExportRegistry: Send + Sync {
    /// Register an export line under a stable identifier.
    fn add(&self, identifier: &str, export_line: &str) -> Result<()>;
    /// Remove the export registered under `identifier`. Removing an absent
    /// identifier is not an error.
    fn remove(&self, identifier: &str) -> Result<()>;
    /// Apply pending changes by reloading the export daemon.
    fn reload_daemon(&self) -> Result<()>;
}

/// The real registry: marker-delimited blocks in `/etc/exports`, validated
/// with `nfsd checkexports` and applied with `sudo nfsd restart`.
pub struct EtcExports {
    path: std::path::PathBuf,
}

impl EtcExports {
    pub fn new() -> Self {
        Self { path: std::path::PathBuf::from("/etc/exports") }
    }

    pub fn at(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    fn write(&self, content: &str) -> Result<()> {
        std::fs::write(&self.path, content)
            .with_context(|| format!("write {}", self.path.display()))
    }

    fn checkexports() -> Result<()> {
        let output = std::process::Command::new("nfsd")
            .arg("checkexports")
            .output()
            .context("spawn `nfsd checkexports`")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nfsd checkexports rejected the export table: {}", stderr.trim());
        }
        Ok(())
    }
}

impl Default for EtcExports {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportRegistry for EtcExports {
    fn add(&self, identifier: &str, export_line: &str) -> Result<()> {
        let previous = self.read()?;
        let (without_block, _) = strip_export_block(&previous, identifier);

        let mut updated = without_block;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!(
            "# BEGIN: {identifier}\n{export_line}\n# END: {identifier}\n"
        ));
        self.write(&updated)?;

        // Roll back a table the daemon would refuse, then surface why.
        if let Err(e) = Self::checkexports() {
            self.write(&previous)?;
            return Err(e).with_context(|| format!("export {identifier:?} rejected"));
        }
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<()> {
        let previous = self.read()?;
        let (updated, found) = strip_export_block(&previous, identifier);
        if found {
            self.write(&updated)?;
        }
        Ok(())
    }

    fn reload_daemon(&self) -> Result<()> {
        let output = std::process::Command::new("sudo")
            .args(["nfsd", "restart"])
            .output()
            .context("spawn `sudo nfsd restart`")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nfsd restart failed: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Remove the `# BEGIN/# END` block for `identifier`, returning the
/// remaining content and whether a block was present.
pub fn strip_export_block(content: &str, identifier: &str) -> (String, bool) {
    let begin = format!("# BEGIN: {identifier}");
    let end = format!("# END: {identifier}");

    let mut result = String::with_capacity(content.len());
    let mut inside = false;
    let mut found = false;

    for line in content.lines() {
        if line == begin {
            inside = true;
            found = true;
        } else if line == end {
            inside = false;
        } else if !inside {
            result.push_str(line);
            result.push('\n');
        }
    }

    (result, found)
}

// ---------------------------------------------------------------------------
// Remote command channel
// ---------------------------------------------------------------------------

/// Executes a shell command inside the guest over an authenticated transport.
///
/// The target is passed per call: the guest address only becomes known once
/// the machine has started and its lease has been resolved.
pub trait RemoteRunner: Send + Sync {
    fn run(&self, user: &str, host: &str, command: &str) -> Result<String>;
}

/// SSH options shared by every invocation.
///
/// * `StrictHostKeyChecking=no` / `UserKnownHostsFile=/dev/null` — guest
///   images are ephemeral; host keys change on every fresh boot.
/// * `BatchMode=yes` — fail instead of prompting for a password.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

/// The real remote channel: `ssh <user>@<guest_ip> <command>`.
pub struct SshRunner;

impl RemoteRunner for SshRunner {
    fn run(&self, user: &str, host: &str, command: &str) -> Result<String> {
        let target = format!("{user}@{host}");
        let output = std::process::Command::new("ssh")
            .args(SSH_OPTS)
            .arg(&target)
            .arg(command)
            .output()
            .with_context(|| format!("spawn ssh to {target}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "remote command failed on {target} (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Block until the remote channel answers a no-op command, with the same
/// spacing as the lease waits.
pub async fn wait_for_remote(remote: &dyn RemoteRunner, user: &str, host: &str) -> Result<()> {
    retry_after(30, Duration::from_secs(2), || async move {
        remote
            .run(user, host, "exit 0")
            .map(|_| ())
            .map_err(|e| anyhow::Error::new(Retriable(format!("remote channel not ready: {e:#}"))))
    })
    .await
    .context("guest never became reachable over the remote command channel")
}

// ---------------------------------------------------------------------------
// Setup / teardown protocols
// ---------------------------------------------------------------------------

/// Stable per-machine, per-share export identifier.
pub fn export_identifier(machine_name: &str, share: &str) -> String {
    format!("hyperkit-machine {machine_name}-{share}")
}

/// Resolve a configured share against the state directory when relative.
fn absolutise(share: &str, paths: &MachinePaths) -> String {
    if Path::new(share).is_absolute() {
        share.to_string()
    } else {
        paths.resolve(share).to_string_lossy().into_owned()
    }
}

/// Export entry granting `guest_ip` all-directories access mapped to the
/// invoking host user.
pub fn compose_export_line(share: &str, guest_ip: &str, map_user: &str) -> String {
    format!("{share} {guest_ip} -alldirs -mapall={map_user}")
}

/// Register every configured share for `guest_ip`, reload the daemon once,
/// and mount the shares inside the guest.
///
/// A registration that collides with an existing export is logged and
/// skipped — the remaining shares still go through. Any other registry error
/// aborts.
pub fn setup_shares(
    spec: &MachineSpec,
    paths: &MachinePaths,
    guest_ip: &str,
    host_ip: &str,
    map_user: &str,
    registry: &dyn ExportRegistry,
    remote: &dyn RemoteRunner,
) -> Result<()> {
    info!(guest_ip, share_count = spec.nfs_shares.len(), "setting up NFS mounts");

    // Literal "\n" sequences: the script travels through `echo -e`.
    let mut mount_script = String::from("#/bin/bash\\n");

    for share in &spec.nfs_shares {
        let share = absolutise(share, paths);
        let identifier = export_identifier(&spec.machine_name, &share);
        let export_line = compose_export_line(&share, guest_ip, map_user);

        match registry.add(&identifier, &export_line) {
            Ok(()) => {}
            Err(e) if format!("{e:#}").contains(CONFLICT_MARKER) => {
                info!(share = %share, error = %e, "conflicting NFS share not setup and ignored");
                continue;
            }
            Err(e) => return Err(e.context(format!("registering NFS export for {share}"))),
        }

        let root = &spec.nfs_shares_root;
        mount_script.push_str(&format!("sudo mkdir -p {root}/{share}\\n"));
        mount_script.push_str(&format!(
            "sudo mount -t nfs -o noacl,async {host_ip}:{share} {root}/{share}\\n"
        ));
    }

    registry
        .reload_daemon()
        .context("reloading the NFS daemon after registering exports")?;

    let command = format!("echo -e \"{mount_script}\" | sh");
    debug!(command = %command, "mounting shares inside the guest");
    remote
        .run(&spec.ssh_user, guest_ip, &command)
        .context("running the NFS mount script inside the guest")?;

    Ok(())
}

/// Remove every configured share's export and reload the daemon once.
///
/// Individual removal failures are logged and never abort the batch. With no
/// configured shares this is a complete no-op.
pub fn teardown_shares(spec: &MachineSpec, paths: &MachinePaths, registry: &dyn ExportRegistry) {
    if spec.nfs_shares.is_empty() {
        return;
    }

    info!(share_count = spec.nfs_shares.len(), "removing NFS exports");
    for share in &spec.nfs_shares {
        let share = absolutise(share, paths);
        let identifier = export_identifier(&spec.machine_name, &share);
        if let Err(e) = registry.remove(&identifier) {
            error!(share = %share, error = %e, "failed removing NFS export");
        }
    }

    if let Err(e) = registry.reload_daemon() {
        error!(error = %e, "failed to reload the NFS daemon");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn export_line_grants_alldirs_mapped_to_user() {
        assert_eq!(
            compose_export_line("/Users/shared", "192.168.64.3", "alice"),
            "/Users/shared 192.168.64.3 -alldirs -mapall=alice"
        );
    }

    #[test]
    fn identifier_is_stable_per_machine_and_share() {
        assert_eq!(
            export_identifier("default", "/Users/shared"),
            "hyperkit-machine default-/Users/shared"
        );
    }

    #[test]
    fn strip_block_removes_only_the_named_block() {
        let content = "\
/existing 10.0.0.1\n\
# BEGIN: id-a\n\
/a 192.168.64.3 -alldirs\n\
# END: id-a\n\
# BEGIN: id-b\n\
/b 192.168.64.3 -alldirs\n\
# END: id-b\n";

        let (stripped, found) = strip_export_block(content, "id-a");
        assert!(found);
        assert!(!stripped.contains("/a 192.168.64.3"));
        assert!(stripped.contains("/existing 10.0.0.1"));
        assert!(stripped.contains("/b 192.168.64.3"));

        let (unchanged, found) = strip_export_block(content, "id-missing");
        assert!(!found);
        assert_eq!(unchanged, content);
    }

    // -----------------------------------------------------------------------
    // Mock collaborators
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingRegistry {
        adds: Mutex<Vec<String>>,
        removes: Mutex<Vec<String>>,
        reloads: Mutex<u32>,
        /// Identifiers whose `add` reports a scope conflict.
        conflicts: Vec<String>,
        /// When set, `remove` fails for these identifiers.
        failing_removes: Vec<String>,
    }

    impl ExportRegistry for RecordingRegistry {
        fn add(&self, identifier: &str, export_line: &str) -> Result<()> {
            if self.conflicts.iter().any(|c| identifier.contains(c.as_str())) {
                bail!("export {export_line} conflicts with existing export");
            }
            self.adds.lock().unwrap().push(identifier.to_string());
            Ok(())
        }

        fn remove(&self, identifier: &str) -> Result<()> {
            if self.failing_removes.iter().any(|c| identifier.contains(c.as_str())) {
                bail!("no such export");
            }
            self.removes.lock().unwrap().push(identifier.to_string());
            Ok(())
        }

        fn reload_daemon(&self) -> Result<()> {
            *self.reloads.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        commands: Mutex<Vec<String>>,
    }

    impl RemoteRunner for RecordingRemote {
        fn run(&self, _user: &str, _host: &str, command: &str) -> Result<String> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(String::new())
        }
    }

    fn share_spec(shares: &[&str]) -> (MachineSpec, MachinePaths) {
        let mut spec = MachineSpec::new("default");
        spec.nfs_shares = shares.iter().map(|s| s.to_string()).collect();
        let paths = MachinePaths::new("/var/machines/default", "default");
        (spec, paths)
    }

    #[test]
    fn setup_registers_each_share_and_reloads_once() {
        let (spec, paths) = share_spec(&["/Users/a", "/Users/b"]);
        let registry = RecordingRegistry::default();
        let remote = RecordingRemote::default();

        setup_shares(&spec, &paths, "192.168.64.3", "192.168.64.1", "alice", &registry, &remote)
            .unwrap();

        assert_eq!(registry.adds.lock().unwrap().len(), 2);
        assert_eq!(*registry.reloads.lock().unwrap(), 1);

        let commands = remote.commands.lock().unwrap();
        assert_eq!(commands.len(), 1, "one mount script for the whole batch");
        assert!(commands[0].contains("mount -t nfs -o noacl,async 192.168.64.1:/Users/a"));
        assert!(commands[0].contains("mount -t nfs -o noacl,async 192.168.64.1:/Users/b"));
    }

    #[test]
    fn setup_conflict_skips_share_but_continues_batch() {
        let (spec, paths) = share_spec(&["/Users/a", "/Users/conflicted", "/Users/c"]);
        let registry = RecordingRegistry {
            conflicts: vec!["/Users/conflicted".to_string()],
            ..Default::default()
        };
        let remote = RecordingRemote::default();

        setup_shares(&spec, &paths, "192.168.64.3", "192.168.64.1", "alice", &registry, &remote)
            .unwrap();

        let adds = registry.adds.lock().unwrap();
        assert_eq!(adds.len(), 2, "conflicted share skipped, others registered");
        assert!(adds.iter().all(|id| !id.contains("/Users/conflicted")));

        // The skipped share gets no mount lines either.
        let commands = remote.commands.lock().unwrap();
        assert!(!commands[0].contains("/Users/conflicted"));
        assert_eq!(*registry.reloads.lock().unwrap(), 1);
    }

    #[test]
    fn setup_relative_share_resolves_against_state_dir() {
        let (spec, paths) = share_spec(&["scratch"]);
        let registry = RecordingRegistry::default();
        let remote = RecordingRemote::default();

        setup_shares(&spec, &paths, "192.168.64.3", "192.168.64.1", "alice", &registry, &remote)
            .unwrap();

        let adds = registry.adds.lock().unwrap();
        assert_eq!(adds[0], "hyperkit-machine default-/var/machines/default/scratch");
    }

    #[test]
    fn teardown_removes_each_share_once_with_one_reload() {
        let (spec, paths) = share_spec(&["/Users/a", "/Users/b", "/Users/c"]);
        let registry = RecordingRegistry::default();

        teardown_shares(&spec, &paths, &registry);

        assert_eq!(registry.removes.lock().unwrap().len(), 3);
        assert_eq!(*registry.reloads.lock().unwrap(), 1);
    }

    #[test]
    fn teardown_with_no_shares_is_a_noop() {
        let (spec, paths) = share_spec(&[]);
        let registry = RecordingRegistry::default();

        teardown_shares(&spec, &paths, &registry);

        assert!(registry.removes.lock().unwrap().is_empty());
        assert_eq!(*registry.reloads.lock().unwrap(), 0);
    }

    #[test]
    fn teardown_removal_failure_does_not_abort_batch() {
        let (spec, paths) = share_spec(&["/Users/a", "/Users/failing", "/Users/c"]);
        let registry = RecordingRegistry {
            failing_removes: vec!["/Users/failing".to_string()],
            ..Default::default()
        };

        teardown_shares(&spec, &paths, &registry);

        assert_eq!(registry.removes.lock().unwrap().len(), 2);
        assert_eq!(*registry.reloads.lock().unwrap(), 1, "reload still happens");
    }
}
