//! Supervised QEMU guests
//!
//! This module contains:
//! - Architecture templates and launch argument rendering
//! - Launch configuration
//! - The process supervisor ([`QemuSystem`]) and its watchdog

pub mod arch;
pub mod config;
pub mod launch;
pub mod watchdog;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::console::session::{ConsoleSession, SessionSettings};
use crate::console::ConsoleChannel;
use crate::{CommandOutput, Error, Result};

use self::arch::Arch;
use self::config::{KernelImage, QemuConfig};
use self::launch::LaunchPlan;
use self::watchdog::Watchdog;

/// Lifecycle state of a supervised guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Constructed and validated, not yet started
    Created,
    /// Hypervisor process is running
    Running,
    /// Stopped by the caller
    Stopped,
    /// Hypervisor exited on its own
    DiedNaturally,
    /// Hypervisor was killed when the watchdog expired
    DiedByWatchdog,
}

impl VmState {
    /// Whether the hypervisor ended without the caller stopping it
    pub fn died(self) -> bool {
        matches!(self, VmState::DiedNaturally | VmState::DiedByWatchdog)
    }

    /// Whether the watchdog ended the hypervisor
    pub fn killed_by_watchdog(self) -> bool {
        self == VmState::DiedByWatchdog
    }

    /// Whether the hypervisor process is live
    pub fn is_running(self) -> bool {
        self == VmState::Running
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Created => "created",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::DiedNaturally => "died",
            VmState::DiedByWatchdog => "killed by watchdog",
        };
        f.write_str(s)
    }
}

/// Child handle and state, guarded together so exactly one path reaps the child
struct Supervisor {
    state: VmState,
    child: Option<Child>,
    watchdog: Option<Watchdog>,
}

impl Supervisor {
    /// Notice a hypervisor that exited on its own
    fn refresh(&mut self) {
        if self.state != VmState::Running {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%status, "hypervisor exited");
                // Reap whatever it left behind in its group.
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                self.state = VmState::DiedNaturally;
                self.child = None;
                if let Some(watchdog) = self.watchdog.take() {
                    watchdog.cancel();
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to poll hypervisor status"),
        }
    }

    /// Move to `next` if still running, handing back the child to terminate
    fn halt(&mut self, next: VmState) -> Option<Child> {
        self.refresh();
        if self.state != VmState::Running {
            return None;
        }
        self.state = next;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        self.child.take()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the direct child.
        if let Some(pid) = self.child.as_ref().and_then(Child::id) {
            kill_group(pid);
        }
    }
}

/// SIGKILL every process in the hypervisor's group, including anything a
/// launcher wrapper forked.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

fn lock(supervisor: &Mutex<Supervisor>) -> MutexGuard<'_, Supervisor> {
    supervisor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kill the hypervisor and reap it
async fn terminate(mut child: Child, reason: &'static str) {
    let pid = child.id();
    if let Some(pid) = pid {
        kill_group(pid);
    }
    if let Err(e) = child.start_kill() {
        debug!(?pid, error = %e, "kill failed, process already gone");
    }
    match child.wait().await {
        Ok(status) => info!(?pid, %status, reason, "hypervisor terminated"),
        Err(e) => warn!(?pid, error = %e, reason, "failed to reap hypervisor"),
    }
}

/// Watchdog action: the first of watchdog and `stop` to take the child wins
async fn expire(supervisor: Weak<Mutex<Supervisor>>) {
    let Some(supervisor) = supervisor.upgrade() else {
        return;
    };
    let child = lock(&supervisor).halt(VmState::DiedByWatchdog);
    if let Some(child) = child {
        terminate(child, "watchdog").await;
    }
}

/// A QEMU guest booted from a kernel image and a raw drive, driven through
/// its serial console.
///
/// # Example
///
/// ```no_run
/// use qemu_box::{Arch, KernelImage, QemuSystem};
///
/// # async fn run() -> qemu_box::Result<()> {
/// let kernel = KernelImage::new("guest", "/boot/vmlinuz").initrd("/boot/initrd.img");
/// let vm = QemuSystem::new(Arch::X86_64, kernel, "rootfs.img")?;
/// vm.start().await?;
/// let passwd = vm.command("root", "cat /etc/passwd").await?;
/// println!("{}", passwd);
/// vm.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct QemuSystem {
    arch: Arch,
    kernel: KernelImage,
    drive: PathBuf,
    config: QemuConfig,
    plan: LaunchPlan,
    supervisor: Arc<Mutex<Supervisor>>,
    session: tokio::sync::Mutex<Option<ConsoleSession>>,
    kernel_panic: Arc<AtomicBool>,
}

impl QemuSystem {
    /// Validate a guest with the default configuration.
    pub fn new<P: AsRef<Path>>(arch: Arch, kernel: KernelImage, drive: P) -> Result<Self> {
        Self::with_config(arch, kernel, drive, QemuConfig::default())
    }

    /// Validate a guest with an explicit configuration.
    ///
    /// Nothing is spawned; configuration errors surface here rather than at
    /// [`start`](Self::start).
    pub fn with_config<P: AsRef<Path>>(
        arch: Arch,
        kernel: KernelImage,
        drive: P,
        config: QemuConfig,
    ) -> Result<Self> {
        let drive = drive.as_ref().to_path_buf();
        let plan = LaunchPlan::build(arch, &kernel, &drive, &config)?;

        debug!(
            %arch,
            kernel = %kernel.name,
            drive = %drive.display(),
            ssh = %plan.ssh_address,
            "validated guest"
        );

        Ok(Self {
            arch,
            kernel,
            drive,
            config,
            plan,
            supervisor: Arc::new(Mutex::new(Supervisor {
                state: VmState::Created,
                child: None,
                watchdog: None,
            })),
            session: tokio::sync::Mutex::new(None),
            kernel_panic: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Set the watchdog deadline; zero disables it. Only allowed before start.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if lock(&self.supervisor).state != VmState::Created {
            return Err(Error::VmAlreadyRunning);
        }
        self.config.timeout = timeout;
        Ok(())
    }

    /// Watchdog deadline (zero means unbounded)
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Guest architecture
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Kernel the guest boots
    pub fn kernel(&self) -> &KernelImage {
        &self.kernel
    }

    /// Drive image path
    pub fn drive(&self) -> &Path {
        &self.drive
    }

    /// Launch configuration
    pub fn config(&self) -> &QemuConfig {
        &self.config
    }

    /// Program that will be executed: the wrapper's first word, if any
    pub fn program(&self) -> String {
        self.argv().into_iter().next().unwrap_or_default()
    }

    /// Rendered hypervisor arguments
    pub fn args(&self) -> &[String] {
        &self.plan.args
    }

    /// Host address forwarded to the guest's SSH port
    pub fn ssh_address(&self) -> &str {
        &self.plan.ssh_address
    }

    /// Process id of the hypervisor while it runs
    pub fn pid(&self) -> Option<u32> {
        lock(&self.supervisor).child.as_ref().and_then(Child::id)
    }

    /// Whether a kernel panic has been seen on the console
    pub fn kernel_panicked(&self) -> bool {
        self.kernel_panic.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> VmState {
        let mut supervisor = lock(&self.supervisor);
        supervisor.refresh();
        supervisor.state
    }

    /// Whether the hypervisor ended on its own or by the watchdog
    pub fn died(&self) -> bool {
        self.state().died()
    }

    /// Whether the watchdog killed the hypervisor
    pub fn killed_by_watchdog(&self) -> bool {
        self.state().killed_by_watchdog()
    }

    /// Full command line: wrapper, hypervisor binary, arguments
    fn argv(&self) -> Vec<String> {
        let binary = match self.config.binary {
            Some(ref path) => path.display().to_string(),
            None => self.plan.binary.clone(),
        };
        let mut argv = self.config.wrapper.clone();
        argv.push(binary);
        argv.extend(self.plan.args.iter().cloned());
        argv
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            boot_timeout: self.config.boot_timeout,
            login_timeout: self.config.login_timeout,
            command_timeout: self.config.command_timeout,
            credentials: self.config.credentials.clone(),
        }
    }

    /// Spawn the hypervisor and arm the watchdog.
    ///
    /// On a spawn failure the instance stays in [`VmState::Created`] and no
    /// watchdog is armed, so `start` may be retried.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut supervisor = lock(&self.supervisor);

        if supervisor.state != VmState::Created {
            return Err(Error::VmAlreadyRunning);
        }

        let argv = self.argv();
        let program = argv[0].clone();
        info!(
            program = %program,
            kernel = %self.kernel.name,
            kvm = self.plan.kvm,
            "starting hypervisor"
        );
        debug!(args = ?&argv[1..], "hypervisor command line");

        let mut command = Command::new(&program);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // Group leader, so termination also reaches forked descendants.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| Error::Spawn {
                binary: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Spawn {
                binary: program,
                source: std::io::Error::other("console pipes unavailable"),
            });
        };

        let channel =
            ConsoleChannel::new(stdout, stdin).with_panic_flag(self.kernel_panic.clone());
        *session = Some(ConsoleSession::new(channel, self.session_settings()));

        let pid = child.id();
        supervisor.child = Some(child);
        supervisor.state = VmState::Running;

        let timeout = self.config.timeout;
        if !timeout.is_zero() {
            let weak = Arc::downgrade(&self.supervisor);
            supervisor.watchdog = Some(Watchdog::arm(timeout, move || expire(weak)));
        }

        info!(?pid, ?timeout, ssh = %self.plan.ssh_address, "hypervisor running");
        Ok(())
    }

    /// Terminate the hypervisor if it is still running and release the
    /// console. Safe to call any number of times, concurrently with the
    /// watchdog.
    pub async fn stop(&self) {
        let child = lock(&self.supervisor).halt(VmState::Stopped);

        if let Some(child) = child {
            terminate(child, "stop").await;
        } else {
            debug!(state = %self.state(), "stop: hypervisor not running");
        }

        // A command in flight fails on its own once the console closes and
        // the session is dropped by the next caller.
        if let Ok(mut session) = self.session.try_lock() {
            session.take();
        }
    }

    /// Run a shell command as `user` and return its output and exit status.
    pub async fn exec(&self, user: &str, command: &str) -> Result<CommandOutput> {
        let mut session = self.session.lock().await;

        let running = {
            let mut supervisor = lock(&self.supervisor);
            supervisor.refresh();
            supervisor.state.is_running()
        };
        if !running {
            session.take();
            return Err(Error::VmNotRunning);
        }

        let session = session.as_mut().ok_or(Error::VmNotRunning)?;
        session.run(user, command).await
    }

    /// Run a shell command as `user` and return its output.
    ///
    /// A non-zero exit status is [`Error::CommandFailed`].
    pub async fn command(&self, user: &str, command: &str) -> Result<String> {
        let result = self.exec(user, command).await?;
        if result.success() {
            Ok(result.output)
        } else {
            Err(Error::CommandFailed {
                exit_code: result.exit_code,
                output: result.output,
            })
        }
    }
}

impl fmt::Debug for QemuSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QemuSystem")
            .field("arch", &self.arch)
            .field("kernel", &self.kernel)
            .field("drive", &self.drive)
            .field("ssh_address", &self.plan.ssh_address)
            .field("state", &lock(&self.supervisor).state)
            .finish()
    }
}
