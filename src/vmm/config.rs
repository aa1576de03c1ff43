//! Configuration for QEMU-backed guests

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// A bootable kernel plus an optional initial ramdisk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    /// Human-readable name used in logs
    pub name: String,
    /// Path to the kernel image (bzImage/vmlinuz/Image)
    pub kernel_path: PathBuf,
    /// Path to the initial ramdisk (optional)
    pub initrd_path: Option<PathBuf>,
}

impl KernelImage {
    /// Create a kernel descriptor without an initrd
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, kernel_path: P) -> Self {
        Self {
            name: name.into(),
            kernel_path: kernel_path.into(),
            initrd_path: None,
        }
    }

    /// Attach an initial ramdisk
    pub fn initrd<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.initrd_path = Some(path.into());
        self
    }
}

/// Whether to request hardware acceleration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvmMode {
    /// Use KVM for native guests when `/dev/kvm` is usable
    #[default]
    Auto,
    /// Always pass `-enable-kvm`
    On,
    /// Pure emulation
    Off,
}

/// Launch and console options for a [`QemuSystem`](crate::QemuSystem)
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Memory size in megabytes (default: 512)
    pub memory_mb: usize,
    /// Number of vCPUs (default: 1)
    pub cpus: usize,
    /// Watchdog deadline after start; zero means unbounded (default: zero)
    pub timeout: Duration,
    /// Hardware acceleration policy (default: auto)
    pub kvm: KvmMode,
    /// Discard guest writes to the drive image (default: true)
    pub snapshot: bool,
    /// Additional kernel command line arguments
    pub extra_cmdline: Vec<String>,
    /// Address for a QEMU GDB stub, e.g. `127.0.0.1:1234`
    pub gdb: Option<String>,
    /// Passwords for guest accounts that require one
    pub credentials: HashMap<String, String>,
    /// How long to wait for the first login prompt (default: 120s)
    pub boot_timeout: Duration,
    /// How long each login step may take (default: 10s)
    pub login_timeout: Duration,
    /// How long a guest command may run (default: 60s)
    pub command_timeout: Duration,
    /// Hypervisor binary to run instead of the architecture default
    pub binary: Option<PathBuf>,
    /// Launcher prefix; the hypervisor command line is appended to it
    pub wrapper: Vec<String>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1,
            timeout: Duration::ZERO,
            kvm: KvmMode::Auto,
            snapshot: true,
            extra_cmdline: Vec::new(),
            gdb: None,
            credentials: HashMap::new(),
            boot_timeout: Duration::from_secs(120),
            login_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            binary: None,
            wrapper: Vec::new(),
        }
    }
}

impl QemuConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory size in megabytes
    pub fn memory_mb(mut self, mb: usize) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Set the number of vCPUs
    pub fn cpus(mut self, count: usize) -> Self {
        self.cpus = count;
        self
    }

    /// Set the watchdog deadline (zero disables it)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the hardware acceleration policy
    pub fn kvm(mut self, mode: KvmMode) -> Self {
        self.kvm = mode;
        self
    }

    /// Enable or disable `-snapshot`
    pub fn snapshot(mut self, enable: bool) -> Self {
        self.snapshot = enable;
        self
    }

    /// Add extra kernel command line arguments
    pub fn extra_cmdline<S: Into<String>>(mut self, args: S) -> Self {
        self.extra_cmdline.push(args.into());
        self
    }

    /// Expose a GDB stub on the given `host:port`
    pub fn gdb<S: Into<String>>(mut self, addr: S) -> Self {
        self.gdb = Some(addr.into());
        self
    }

    /// Register the password for a guest account
    pub fn password<U: Into<String>, P: Into<String>>(mut self, user: U, password: P) -> Self {
        self.credentials.insert(user.into(), password.into());
        self
    }

    /// Set how long to wait for the guest to reach its login prompt
    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    /// Set how long each login step may take
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set how long a single guest command may run
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run this binary instead of `qemu-system-<arch>`
    pub fn binary<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.binary = Some(path.into());
        self
    }

    /// Launch through a wrapper such as `["taskset", "-c", "2"]`.
    ///
    /// The wrapper leads its own process group and the whole group is
    /// killed on stop, so a hypervisor it forks goes down with it. A
    /// privilege-raising wrapper (`sudo`) puts the group out of reach of an
    /// unprivileged supervisor.
    pub fn wrapper<I, S>(mut self, wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    /// Build the kernel command line for the given console and root devices
    pub fn kernel_cmdline(&self, console_device: &str, root_device: &str) -> String {
        let mut cmdline = vec![
            format!("root={}", root_device),
            format!("console={}", console_device),
            "rw".to_string(),
        ];

        cmdline.extend(self.extra_cmdline.clone());

        cmdline.join(" ")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb < 64 {
            return Err(Error::Config("Memory must be at least 64MB".into()));
        }

        if self.cpus == 0 {
            return Err(Error::Config("Must have at least 1 vCPU".into()));
        }

        if self.boot_timeout.is_zero()
            || self.login_timeout.is_zero()
            || self.command_timeout.is_zero()
        {
            return Err(Error::Config("Console timeouts must be non-zero".into()));
        }

        if let Some(ref gdb) = self.gdb {
            if !gdb.contains(':') {
                return Err(Error::Config(format!(
                    "GDB address must be host:port, got {}",
                    gdb
                )));
            }
        }

        Ok(())
    }
}
