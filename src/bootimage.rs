//! Boot artifact extraction from a read-only boot image.
//!
//! The boot image carries a kernel, an initial ramdisk and a bootloader
//! configuration. Before the hypervisor can boot the machine, those three
//! things have to be pulled out into the state directory:
//!
//! 1. attach the image read-only at a scoped mount point
//! 2. read the kernel options out of `isolinux.cfg` (unless pre-configured)
//! 3. locate kernel and initrd by naming convention (unless pre-configured)
//! 4. copy both into the state directory
//! 5. detach, no matter what happened in 2–4
//!
//! Extraction never mutates the source image and may be re-run; a re-run
//! overwrites previously extracted artifacts.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, warn};

use crate::machine::{MachinePaths, MachineSpec};

/// Kernel image naming convention: `vmlinuz`, `vmlinux`, `bzImage`,
/// optionally suffixed with digits (`vmlinuz64`, `bzImage4`).
static KERNEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(vmlinu[xz]|bzImage)[\d]*").expect("kernel pattern compiles"));

/// Bootloader `append` directive carrying the kernel options.
static KERNEL_OPTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\t|\s{2})append\s+([[:print:]]+)").expect("append pattern compiles")
});

// ---------------------------------------------------------------------------
// Image mounter
// ---------------------------------------------------------------------------

/// Attach/detach of a disk image at a mount point.
pub trait ImageMounter: Send + Sync {
    fn attach(&self, image: &Path, mountpoint: &Path) -> Result<()>;
    fn detach(&self, mountpoint: &Path) -> Result<()>;
}

/// The real mounter, shelling out to `hdiutil`.
pub struct Hdiutil;

impl Hdiutil {
    fn run(args: &[&str]) -> Result<()> {
        let output = std::process::Command::new("hdiutil")
            .args(args)
            .output()
            .with_context(|| format!("spawn `hdiutil {}`", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "hdiutil {} failed (exit {}): {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

impl ImageMounter for Hdiutil {
    fn attach(&self, image: &Path, mountpoint: &Path) -> Result<()> {
        std::fs::create_dir_all(mountpoint)
            .with_context(|| format!("create mount point {}", mountpoint.display()))?;
        Self::run(&[
            "attach",
            &image.to_string_lossy(),
            "-mountpoint",
            &mountpoint.to_string_lossy(),
            "-readonly",
            "-nobrowse",
        ])
    }

    fn detach(&self, mountpoint: &Path) -> Result<()> {
        Self::run(&["detach", &mountpoint.to_string_lossy()])
    }
}

// ---------------------------------------------------------------------------
// Artifact discovery
// ---------------------------------------------------------------------------

/// Result of scanning a mounted image tree for boot artifacts.
#[derive(Debug, Default)]
pub struct BootScan {
    /// First file matching the kernel naming convention.
    pub kernel: Option<PathBuf>,
    /// First file whose name contains `initrd`.
    pub initrd: Option<PathBuf>,
}

/// Walk `root` and return the first kernel and initrd candidates.
///
/// When an expected file name is given (artifact names pre-configured in the
/// machine spec), only that exact name matches; otherwise the naming
/// conventions apply. Pure scan — no state is mutated during traversal.
pub fn scan_boot_artifacts(
    root: &Path,
    expected_kernel: Option<&str>,
    expected_initrd: Option<&str>,
) -> BootScan {
    let mut scan = BootScan::default();

    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();

        if scan.kernel.is_none() {
            let matched = match expected_kernel {
                Some(expected) => name == expected,
                None => KERNEL_PATTERN.is_match(&name),
            };
            if matched {
                scan.kernel = Some(entry.path().to_path_buf());
            }
        }

        if scan.initrd.is_none() {
            let matched = match expected_initrd {
                Some(expected) => name == expected,
                None => name.contains("initrd"),
            };
            if matched {
                scan.initrd = Some(entry.path().to_path_buf());
            }
        }

        if scan.kernel.is_some() && scan.initrd.is_some() {
            break;
        }
    }

    scan
}

/// Pull the kernel options out of bootloader configuration content: the
/// capture of the first line matching the `append` directive.
pub fn extract_append_options(config: &str) -> Option<String> {
    KERNEL_OPTION_PATTERN
        .captures(config)
        .map(|caps| caps[1].trim().to_string())
}

/// Find `isolinux.cfg` under the mounted tree and extract the kernel options.
fn discover_cmdline(mount_root: &Path) -> Result<String> {
    let config_path = walkdir::WalkDir::new(mount_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_file() && e.file_name().to_string_lossy().contains("isolinux.cfg")
        })
        .map(|e| e.path().to_path_buf());

    let Some(config_path) = config_path else {
        bail!("not able to parse isolinux.cfg: no bootloader configuration in image");
    };

    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read {}", config_path.display()))?;

    extract_append_options(&content).ok_or_else(|| {
        anyhow::anyhow!(
            "not able to parse isolinux.cfg: no append directive in {}",
            config_path.display()
        )
    })
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract kernel, initrd and boot command line from the machine's boot
/// image into its state directory.
///
/// Fills `spec.boot_cmdline`, `spec.vmlinuz` and `spec.initrd` when they are
/// not pre-configured. The image is detached unconditionally: a detach
/// failure after a successful extraction is reported to the caller, a detach
/// failure after a failed extraction is logged and the extraction error wins.
pub fn extract_boot_artifacts(
    spec: &mut MachineSpec,
    paths: &MachinePaths,
    mounter: &dyn ImageMounter,
) -> Result<()> {
    debug!(image = %paths.boot_iso.display(), "attaching boot image");
    mounter.attach(&paths.boot_iso, &paths.iso_mount)?;

    let extracted = copy_artifacts_from_mount(spec, paths);

    debug!(mountpoint = %paths.iso_mount.display(), "detaching boot image");
    let detached = mounter.detach(&paths.iso_mount);

    match (extracted, detached) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(detach_err)) => {
            Err(detach_err.context("extraction succeeded but detaching the boot image failed"))
        }
        (Err(extract_err), Ok(())) => Err(extract_err),
        (Err(extract_err), Err(detach_err)) => {
            warn!(error = %detach_err, "detach failed while unwinding a failed extraction");
            Err(extract_err)
        }
    }
}

/// Steps 2–5 of the protocol, run while the image is attached.
fn copy_artifacts_from_mount(spec: &mut MachineSpec, paths: &MachinePaths) -> Result<()> {
    if spec.boot_cmdline.is_none() {
        let cmdline = discover_cmdline(&paths.iso_mount)?;
        debug!(cmdline = %cmdline, "extracted kernel options");
        spec.boot_cmdline = Some(cmdline);
    }

    let scan = scan_boot_artifacts(
        &paths.iso_mount,
        spec.vmlinuz.as_deref(),
        spec.initrd.as_deref(),
    );

    let (Some(kernel_src), Some(initrd_src)) = (scan.kernel, scan.initrd) else {
        bail!("can't extract kernel and ramdisk from boot image");
    };

    let kernel_name = file_name(&kernel_src)?;
    let initrd_name = file_name(&initrd_src)?;

    let kernel_dest = paths.resolve(&kernel_name);
    debug!(src = %kernel_src.display(), dest = %kernel_dest.display(), "extracting kernel");
    std::fs::copy(&kernel_src, &kernel_dest)
        .with_context(|| format!("copy kernel to {}", kernel_dest.display()))?;

    let initrd_dest = paths.resolve(&initrd_name);
    debug!(src = %initrd_src.display(), dest = %initrd_dest.display(), "extracting initrd");
    std::fs::copy(&initrd_src, &initrd_dest)
        .with_context(|| format!("copy initrd to {}", initrd_dest.display()))?;

    spec.vmlinuz = Some(kernel_name);
    spec.initrd = Some(initrd_name);
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_pattern_matches_naming_convention() {
        for name in ["vmlinuz", "vmlinux", "bzImage", "vmlinuz64", "bzImage4"] {
            assert!(KERNEL_PATTERN.is_match(name), "{name} should match");
        }
        for name in ["linux", "kernel.img", "initrd.img"] {
            assert!(!KERNEL_PATTERN.is_match(name), "{name} should not match");
        }
    }

    #[test]
    fn append_options_extracted_from_isolinux_config() {
        let config = "default boot2docker\n\
                      label boot2docker\n\
                      \tkernel /boot/vmlinuz64\n\
                      \tappend loglevel=3 user=docker console=ttyS0 noembed nomodeset\n";
        assert_eq!(
            extract_append_options(config).as_deref(),
            Some("loglevel=3 user=docker console=ttyS0 noembed nomodeset")
        );
    }

    #[test]
    fn append_options_absent_when_no_directive() {
        assert_eq!(extract_append_options("default boot\nlabel boot\n"), None);
        // "append" at line start lacks the leading tab/space signature.
        assert_eq!(extract_append_options("append foo=bar\n"), None);
    }

    fn fake_image_tree(root: &Path) {
        std::fs::create_dir_all(root.join("boot/isolinux")).unwrap();
        std::fs::write(
            root.join("boot/isolinux/isolinux.cfg"),
            "label boot\n\tkernel /boot/vmlinuz64\n\tappend loglevel=3 console=ttyS0\n",
        )
        .unwrap();
        std::fs::write(root.join("boot/vmlinuz64"), b"kernel bits").unwrap();
        std::fs::write(root.join("boot/initrd.img"), b"ramdisk bits").unwrap();
    }

    #[test]
    fn scan_finds_first_kernel_and_initrd() {
        let dir = tempfile::tempdir().unwrap();
        fake_image_tree(dir.path());

        let scan = scan_boot_artifacts(dir.path(), None, None);
        assert!(scan.kernel.unwrap().ends_with("vmlinuz64"));
        assert!(scan.initrd.unwrap().ends_with("initrd.img"));
    }

    #[test]
    fn scan_honours_preconfigured_names() {
        let dir = tempfile::tempdir().unwrap();
        fake_image_tree(dir.path());
        std::fs::write(dir.path().join("boot/custom-initrd.gz"), b"x").unwrap();

        let scan = scan_boot_artifacts(dir.path(), Some("vmlinuz64"), Some("custom-initrd.gz"));
        assert!(scan.kernel.unwrap().ends_with("vmlinuz64"));
        assert!(scan.initrd.unwrap().ends_with("custom-initrd.gz"));
    }

    #[test]
    fn scan_reports_missing_artifacts_as_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"nothing bootable").unwrap();

        let scan = scan_boot_artifacts(dir.path(), None, None);
        assert!(scan.kernel.is_none());
        assert!(scan.initrd.is_none());
    }
}
