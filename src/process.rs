//! Process liveness probes and signal delivery.
//!
//! Two kinds of check, with different costs and strengths:
//!
//! - [`pid_state`] locates the pid in the process table and inspects its
//!   executable name, so a recycled pid owned by some unrelated process is
//!   classified as stopped rather than mistaken for the hypervisor.
//! - [`ProcHandle::is_alive`] sends the zero signal — cheap, but only
//!   answers "does any process with this pid exist".

use anyhow::{Context, Result};
use tracing::debug;

use crate::machine::VmState;

/// Substring identifying the hypervisor executable family
/// (`hyperkit`, `com.docker.hyperkit`).
pub const HYPERVISOR_FAMILY: &str = "hyper";

// ---------------------------------------------------------------------------
// Process enumerator
// ---------------------------------------------------------------------------

/// Looks a process up in the process table by pid.
pub trait ProcessProbe: Send + Sync {
    /// The executable name for `pid`, or `None` when no such process exists.
    /// `Err` means the probe itself failed — callers must not read that as
    /// "not running".
    fn executable_name(&self, pid: i32) -> Result<Option<String>>;
}

/// Real probe backed by the system process table.
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn executable_name(&self, pid: i32) -> Result<Option<String>> {
        let Ok(pid) = u32::try_from(pid) else {
            return Ok(None);
        };

        let mut sys = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(pid);
        sys.refresh_process(pid);

        Ok(sys.process(pid).map(|p| p.name().to_string()))
    }
}

/// Classify what the recorded pid currently refers to.
///
/// Stopped covers every benign case: pid 0, no such process, or a live
/// process outside the hypervisor family (a recycled pid). Only a live
/// process whose executable name contains [`HYPERVISOR_FAMILY`] counts as
/// running.
pub fn pid_state(probe: &dyn ProcessProbe, pid: i32) -> Result<VmState> {
    if pid == 0 {
        return Ok(VmState::Stopped);
    }

    match probe.executable_name(pid)? {
        None => {
            debug!(pid, "hypervisor pid missing from process table");
            Ok(VmState::Stopped)
        }
        Some(name) if !name.contains(HYPERVISOR_FAMILY) => {
            debug!(pid, executable = %name, "pid is stale and in use by another process");
            Ok(VmState::Stopped)
        }
        Some(_) => Ok(VmState::Running),
    }
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

/// A narrow handle over one supervised process.
///
/// Decouples the lifecycle controller from raw signal numbers: termination
/// is expressed as graceful or immediate, existence as a boolean.
#[derive(Debug, Clone, Copy)]
pub struct ProcHandle {
    pid: i32,
}

impl ProcHandle {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Zero-signal existence check. Delivery failure means "not running".
    pub fn is_alive(&self) -> bool {
        if self.pid <= 0 {
            return false;
        }
        unsafe { libc::kill(self.pid, 0) == 0 }
    }

    /// Deliver a termination signal: SIGTERM when graceful, SIGKILL when not.
    ///
    /// Refuses non-positive pids — signalling pid 0 would hit the whole
    /// process group, not a machine.
    pub fn terminate(&self, graceful: bool) -> Result<()> {
        if self.pid <= 0 {
            anyhow::bail!("no process to signal (pid {})", self.pid);
        }
        let signal = if graceful { libc::SIGTERM } else { libc::SIGKILL };
        let rc = unsafe { libc::kill(self.pid, signal) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("sending signal {signal} to pid {}", self.pid));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeProbe {
        /// (pid, executable name) table; `Err` simulated via `failing`.
        table: Vec<(i32, &'static str)>,
        failing: bool,
        calls: Mutex<u32>,
    }

    impl FakeProbe {
        fn with(table: Vec<(i32, &'static str)>) -> Self {
            Self { table, failing: false, calls: Mutex::new(0) }
        }
    }

    impl ProcessProbe for FakeProbe {
        fn executable_name(&self, pid: i32) -> Result<Option<String>> {
            *self.calls.lock().unwrap() += 1;
            if self.failing {
                anyhow::bail!("process table unavailable");
            }
            Ok(self
                .table
                .iter()
                .find(|(p, _)| *p == pid)
                .map(|(_, name)| name.to_string()))
        }
    }

    #[test]
    fn pid_zero_is_stopped_without_probing() {
        let probe = FakeProbe::with(vec![]);
        assert_eq!(pid_state(&probe, 0).unwrap(), VmState::Stopped);
        assert_eq!(*probe.calls.lock().unwrap(), 0);
    }

    #[test]
    fn missing_pid_is_stopped_never_error() {
        let probe = FakeProbe::with(vec![]);
        assert_eq!(pid_state(&probe, 4242).unwrap(), VmState::Stopped);
    }

    #[test]
    fn foreign_executable_is_stopped() {
        let probe = FakeProbe::with(vec![(4242, "some-editor")]);
        assert_eq!(pid_state(&probe, 4242).unwrap(), VmState::Stopped);
    }

    #[test]
    fn hypervisor_family_is_running() {
        for name in ["hyperkit", "com.docker.hyperkit"] {
            let probe = FakeProbe::with(vec![(4242, name)]);
            assert_eq!(pid_state(&probe, 4242).unwrap(), VmState::Running, "{name}");
        }
    }

    #[test]
    fn probe_failure_propagates_as_error() {
        let probe = FakeProbe { table: vec![], failing: true, calls: Mutex::new(0) };
        assert!(pid_state(&probe, 4242).is_err());
    }

    #[test]
    fn current_process_is_alive() {
        let handle = ProcHandle::new(std::process::id() as i32);
        assert!(handle.is_alive());
    }

    #[test]
    fn nonexistent_pid_is_not_alive() {
        // Far above any real pid on the test host.
        assert!(!ProcHandle::new(999_999_999).is_alive());
        assert!(!ProcHandle::new(0).is_alive());
        assert!(!ProcHandle::new(-1).is_alive());
    }
}
