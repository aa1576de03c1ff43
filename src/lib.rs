//! qemu-box: supervised QEMU guests driven over the serial console
//!
//! Boots a Linux kernel under a QEMU system emulator, logs in on the guest's
//! serial console and runs shell commands there, with an optional watchdog
//! that kills the guest after a deadline.
//!
//! # Key Features
//!
//! - **Eager validation**: kernel, initrd, drive and architecture are checked
//!   before anything is spawned
//! - **Console protocol**: login handling and sentinel-framed command output
//!   with exit status
//! - **Watchdog**: bounded guest lifetime, observable as an outcome
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use qemu_box::{Arch, KernelImage, QemuConfig, QemuSystem};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kernel = KernelImage::new("guest", "/path/to/bzImage")
//!         .initrd("/path/to/initrd.img");
//!     let config = QemuConfig::new()
//!         .memory_mb(256)
//!         .timeout(Duration::from_secs(60));
//!
//!     let vm = QemuSystem::with_config(Arch::X86_64, kernel, "/path/to/rootfs.img", config)?;
//!     vm.start().await?;
//!
//!     let output = vm.exec("root", "uname -a").await?;
//!     println!("output: {}", output.output);
//!     println!("exit code: {}", output.exit_code);
//!
//!     vm.stop().await;
//!     Ok(())
//! }
//! ```

pub mod console;
pub mod error;
pub mod network;
pub mod vmm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use network::reserve_free_address;
pub use vmm::arch::Arch;
pub use vmm::config::{KernelImage, KvmMode, QemuConfig};
pub use vmm::{QemuSystem, VmState};

/// Output from running a command in the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Console output of the command, stdout and stderr interleaved
    pub output: String,
    /// Exit status of the command
    pub exit_code: i32,
}

impl CommandOutput {
    /// Create a new CommandOutput
    pub fn new(output: String, exit_code: i32) -> Self {
        Self { output, exit_code }
    }

    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
