//! Launch argument builder
//!
//! Turns an architecture, a kernel descriptor and a drive image into the
//! ordered argument list for the QEMU binary. All filesystem validation
//! happens here, before anything is spawned.

use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::debug;

use super::arch::Arch;
use super::config::{KernelImage, KvmMode, QemuConfig};
use crate::network::{reserve_free_address, NetworkConfig, GUEST_SSH_PORT};
use crate::{Error, Result};

/// A validated, rendered hypervisor invocation
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// QEMU binary name
    pub binary: String,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Host side of the guest SSH forward
    pub ssh_address: String,
    /// Whether `-enable-kvm` was requested
    pub kvm: bool,
}

impl LaunchPlan {
    /// Validate the inputs and render the argument list.
    ///
    /// Fails with [`Error::InvalidPath`] for an unreadable kernel, initrd or
    /// drive, with [`Error::UnsupportedArchitecture`] for an architecture
    /// without a template, and with [`Error::Config`] for invalid options.
    pub fn build(
        arch: Arch,
        kernel: &KernelImage,
        drive: &Path,
        config: &QemuConfig,
    ) -> Result<Self> {
        require_file("kernel", &kernel.kernel_path)?;
        if let Some(ref initrd) = kernel.initrd_path {
            require_file("initrd", initrd)?;
        }
        require_file("drive", drive)?;

        let template = arch.template()?;
        config.validate()?;

        let kvm = match config.kvm {
            KvmMode::On => true,
            KvmMode::Off => false,
            KvmMode::Auto => arch.is_native() && kvm_usable(),
        };

        let ssh_address = reserve_free_address()?;

        let mut args: Vec<String> = template
            .machine_args
            .iter()
            .map(|s| s.to_string())
            .collect();

        // Headless: serial on stdio, no monitor multiplexed into it.
        args.extend(
            ["-display", "none", "-monitor", "none", "-serial", "stdio", "-no-reboot"]
                .iter()
                .map(|s| s.to_string()),
        );

        if config.snapshot {
            args.push("-snapshot".into());
        }

        args.push("-smp".into());
        args.push(config.cpus.to_string());
        args.push("-m".into());
        args.push(config.memory_mb.to_string());

        args.push("-kernel".into());
        args.push(kernel.kernel_path.display().to_string());
        if let Some(ref initrd) = kernel.initrd_path {
            args.push("-initrd".into());
            args.push(initrd.display().to_string());
        }
        args.push("-append".into());
        args.push(config.kernel_cmdline(template.console_device, template.root_device));

        args.push("-drive".into());
        args.push(format!(
            "file={},format=raw,if={},index=0,media=disk",
            escape_option_value(&drive.display().to_string()),
            template.drive_interface
        ));

        args.extend(
            NetworkConfig::user()
                .model("virtio-net-pci")
                .forward(ssh_address.clone(), GUEST_SSH_PORT)
                .to_args(),
        );

        if kvm {
            args.push("-enable-kvm".into());
            args.push("-cpu".into());
            args.push("host".into());
        }

        if let Some(ref gdb) = config.gdb {
            args.push("-gdb".into());
            args.push(format!("tcp:{}", gdb));
        }

        debug!(
            kernel = %kernel.name,
            binary = template.binary,
            kvm,
            "rendered launch arguments"
        );

        Ok(Self {
            binary: template.binary.to_string(),
            args,
            ssh_address,
            kvm,
        })
    }
}

/// Fail unless `path` names a readable regular file.
pub fn require_file(kind: &'static str, path: &Path) -> Result<()> {
    let invalid = |reason: String| Error::InvalidPath {
        kind,
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".into()));
    }
    File::open(path).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// Whether `/dev/kvm` can be opened read-write by this process.
pub fn kvm_usable() -> bool {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok()
}

/// QEMU option values treat `,` as a separator; a literal comma is `,,`.
fn escape_option_value(value: &str) -> String {
    value.replace(',', ",,")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn artifact(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"\x7fELF").unwrap();
        (dir, path)
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("missing {flag} in {args:?}"))
    }

    #[test]
    fn test_build_x86_64() {
        let (_kdir, kernel_path) = artifact("bzImage");
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("test", &kernel_path);
        let config = QemuConfig::new().kvm(KvmMode::Off).cpus(2).memory_mb(256);

        let plan = LaunchPlan::build(Arch::X86_64, &kernel, &drive, &config).unwrap();

        assert_eq!(plan.binary, "qemu-system-x86_64");
        assert!(!plan.kvm);
        let args = &plan.args;
        assert_eq!(args[position(args, "-kernel") + 1], kernel_path.display().to_string());
        assert_eq!(args[position(args, "-smp") + 1], "2");
        assert_eq!(args[position(args, "-m") + 1], "256");
        assert_eq!(
            args[position(args, "-append") + 1],
            "root=/dev/sda console=ttyS0 rw"
        );
        assert_eq!(args[position(args, "-serial") + 1], "stdio");
        assert!(args.contains(&"-snapshot".to_string()));
        assert!(!args.contains(&"-initrd".to_string()));
        assert!(!args.contains(&"-enable-kvm".to_string()));
        assert!(args[position(args, "-nic") + 1]
            .contains(&format!("hostfwd=tcp:{}-:22", plan.ssh_address)));
    }

    #[test]
    fn test_build_with_initrd_and_gdb() {
        let (_kdir, kernel_path) = artifact("Image");
        let (_idir, initrd) = artifact("initrd.img");
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("arm", &kernel_path).initrd(&initrd);
        let config = QemuConfig::new().kvm(KvmMode::On).gdb("127.0.0.1:1234");

        let plan = LaunchPlan::build(Arch::Aarch64, &kernel, &drive, &config).unwrap();

        let args = &plan.args;
        assert_eq!(plan.binary, "qemu-system-aarch64");
        assert_eq!(args[0], "-machine");
        assert_eq!(args[position(args, "-initrd") + 1], initrd.display().to_string());
        assert!(args[position(args, "-append") + 1].contains("console=ttyAMA0"));
        assert!(args[position(args, "-drive") + 1].contains("if=virtio"));
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert_eq!(args[position(args, "-gdb") + 1], "tcp:127.0.0.1:1234");
    }

    #[test]
    fn test_drive_path_commas_escaped() {
        let (_kdir, kernel_path) = artifact("bzImage");
        let (_ddir, drive) = artifact("disk,v2.img");
        let kernel = KernelImage::new("test", &kernel_path);
        let config = QemuConfig::new().kvm(KvmMode::Off);

        let plan = LaunchPlan::build(Arch::X86_64, &kernel, &drive, &config).unwrap();
        let drive_arg = &plan.args[position(&plan.args, "-drive") + 1];
        assert!(drive_arg.contains("disk,,v2.img"));
    }

    #[test]
    fn test_missing_kernel() {
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("missing", "/invalid/path");
        let err = LaunchPlan::build(Arch::X86_64, &kernel, &drive, &QemuConfig::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { kind: "kernel", .. }));
    }

    #[test]
    fn test_missing_initrd() {
        let (_kdir, kernel_path) = artifact("bzImage");
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("test", &kernel_path).initrd("/invalid/initrd");
        let err = LaunchPlan::build(Arch::X86_64, &kernel, &drive, &QemuConfig::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { kind: "initrd", .. }));
    }

    #[test]
    fn test_drive_must_be_file() {
        let (kdir, kernel_path) = artifact("bzImage");
        let kernel = KernelImage::new("test", &kernel_path);
        let err = LaunchPlan::build(Arch::X86_64, &kernel, kdir.path(), &QemuConfig::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { kind: "drive", .. }));
    }

    #[test]
    fn test_unsupported_arch() {
        let (_kdir, kernel_path) = artifact("bzImage");
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("test", &kernel_path);
        let err = LaunchPlan::build(Arch::Unsupported, &kernel, &drive, &QemuConfig::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(Arch::Unsupported)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_kdir, kernel_path) = artifact("bzImage");
        let (_ddir, drive) = artifact("rootfs.img");
        let kernel = KernelImage::new("test", &kernel_path);
        let err = LaunchPlan::build(Arch::X86_64, &kernel, &drive, &QemuConfig::new().cpus(0))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
