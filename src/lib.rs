//! hyperkit-machine: lifecycle controller for hyperkit virtual machines.
//!
//! Sits between a machine-provisioning tool and the `hyperkit` hypervisor
//! process on a macOS host. Owns everything around the hypervisor that the
//! provisioning tool should not have to care about:
//!
//! - extracting a bootable kernel/initrd pair out of a read-only boot image
//! - starting and stopping the hypervisor process, including recovery from
//!   a previous unclean shutdown
//! - resolving the guest's IP address from the host DHCP lease table
//! - exporting host directories into the guest over NFS
//!
//! ```text
//! HyperkitDriver::start()
//!     ├─► recover_from_unclean_shutdown()
//!     ├─► Hypervisor::launch(LaunchConfig)     →  hyperkit child process
//!     ├─► wait_for_ip()                        →  /var/db/dhcpd_leases
//!     └─► setup_shares()   (only when NFS shares are configured)
//! ```
//!
//! The crate is a library invoked programmatically through the lifecycle
//! operations on [`HyperkitDriver`]; external state (hypervisor executor,
//! process table, DHCP leases, NFS export registry, ssh channel) is reached
//! through narrow traits so every lifecycle path is testable without a host.

pub mod bootimage;
pub mod driver;
pub mod hypervisor;
pub mod logging;
pub mod machine;
pub mod network;
pub mod nfs;
pub mod process;
pub mod retry;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use driver::HyperkitDriver;
pub use hypervisor::{Hypervisor, LaunchConfig};
pub use machine::{MachinePaths, MachineSpec, VmState};
pub use network::LeaseSource;
pub use nfs::{ExportRegistry, RemoteRunner};
pub use process::{ProcHandle, ProcessProbe};
pub use retry::{Retriable, retry_after};
