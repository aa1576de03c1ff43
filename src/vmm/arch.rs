//! Guest architectures and their QEMU launch templates
//!
//! The set of architectures is closed: each variant knows its QEMU binary,
//! the machine flags it needs, and the device names its kernel sees. The
//! `Unsupported` variant has no template and always fails validation.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Guest architecture selecting the hypervisor binary and launch template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 64-bit x86 (`qemu-system-x86_64`)
    X86_64,
    /// 32-bit x86 (`qemu-system-i386`)
    I386,
    /// 64-bit ARM (`qemu-system-aarch64`, `virt` machine)
    Aarch64,
    /// Placeholder for an architecture without a launch template
    Unsupported,
}

/// Launch template for a supported architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchTemplate {
    /// QEMU binary name, resolved through `PATH`
    pub binary: &'static str,
    /// Machine/CPU flags placed before everything else
    pub machine_args: &'static [&'static str],
    /// Serial device the guest kernel writes its console to
    pub console_device: &'static str,
    /// Block device the root drive appears as
    pub root_device: &'static str,
    /// `if=` interface for the root drive
    pub drive_interface: &'static str,
}

impl Arch {
    /// All architectures with a launch template.
    pub const SUPPORTED: [Arch; 3] = [Arch::X86_64, Arch::I386, Arch::Aarch64];

    /// Look up the launch template, failing for `Unsupported`.
    pub fn template(self) -> Result<ArchTemplate> {
        match self {
            Arch::X86_64 => Ok(ArchTemplate {
                binary: "qemu-system-x86_64",
                machine_args: &[],
                console_device: "ttyS0",
                root_device: "/dev/sda",
                drive_interface: "ide",
            }),
            Arch::I386 => Ok(ArchTemplate {
                binary: "qemu-system-i386",
                machine_args: &[],
                console_device: "ttyS0",
                root_device: "/dev/sda",
                drive_interface: "ide",
            }),
            Arch::Aarch64 => Ok(ArchTemplate {
                binary: "qemu-system-aarch64",
                machine_args: &["-machine", "virt", "-cpu", "cortex-a57"],
                console_device: "ttyAMA0",
                root_device: "/dev/vda",
                drive_interface: "virtio",
            }),
            Arch::Unsupported => Err(Error::UnsupportedArchitecture(self)),
        }
    }

    /// Whether guests of this architecture can run under KVM on this host.
    pub fn is_native(self) -> bool {
        match self {
            Arch::X86_64 => cfg!(target_arch = "x86_64"),
            Arch::I386 => cfg!(any(target_arch = "x86", target_arch = "x86_64")),
            Arch::Aarch64 => cfg!(target_arch = "aarch64"),
            Arch::Unsupported => false,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I386 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "i386" | "x86" => Ok(Arch::I386),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(Error::Config(format!("unknown architecture: {}", other))),
        }
    }
}
