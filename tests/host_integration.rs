//! Integration tests against a real host.
//!
//! These tests exercise the real collaborators — hyperkit, hdiutil, the
//! vmnet DHCP server — and therefore need macOS, an installed hyperkit, a
//! boot image, and elevated permissions. They are gated behind the
//! `host-integration-tests` feature flag.
//!
//! # Running
//!
//! ```bash
//! sudo cargo test --features host-integration-tests --test host_integration
//! ```
//!
//! Point `HYPERKIT_MACHINE_TEST_ISO` at a bootable ISO (kernel + initrd +
//! isolinux configuration); without it the full-lifecycle test is skipped.

#![cfg(all(feature = "host-integration-tests", target_os = "macos"))]

use std::path::PathBuf;

use hyperkit_machine::driver::HyperkitDriver;
use hyperkit_machine::machine::{MachineSpec, VmState};

fn test_iso() -> Option<PathBuf> {
    std::env::var("HYPERKIT_MACHINE_TEST_ISO").ok().map(PathBuf::from)
}

#[tokio::test]
async fn full_lifecycle_against_real_host() {
    let Some(iso) = test_iso() else {
        eprintln!("HYPERKIT_MACHINE_TEST_ISO not set — skipping");
        return;
    };

    let state = tempfile::tempdir().expect("state dir");
    let mut spec = MachineSpec::new("integration-test");
    spec.boot_image = Some(iso);
    spec.disk_size_mb = 1024;
    spec.memory_mb = 1024;

    let mut driver = HyperkitDriver::new(spec, state.path());

    driver.create().await.expect("create should boot the machine");
    assert_eq!(driver.state(), VmState::Running);
    assert!(driver.ip_address().is_some(), "start must resolve an IP");

    driver.stop().expect("graceful stop");

    // SIGTERM delivery is asynchronous; give the process a moment.
    for _ in 0..30 {
        if driver.state() == VmState::Stopped {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    assert_eq!(driver.state(), VmState::Stopped);
}

#[test]
fn state_of_fresh_directory_is_stopped_on_real_probe() {
    let state = tempfile::tempdir().expect("state dir");
    let driver = HyperkitDriver::new(MachineSpec::new("probe-test"), state.path());

    assert_eq!(driver.state(), VmState::Stopped);
}
