use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use qemu_box::{Arch, Error, KernelImage, KvmMode, QemuConfig, QemuSystem};

/// Boot a kernel under QEMU and run one command on its serial console
#[derive(Parser, Debug)]
#[command(name = "qemubox", version, about)]
struct Cli {
    /// Guest architecture (x86_64, i386, aarch64)
    #[arg(long, default_value = "x86_64")]
    arch: Arch,

    /// Kernel image
    #[arg(long, env = "QEMU_BOX_KERNEL")]
    kernel: PathBuf,

    /// Initial ramdisk
    #[arg(long, env = "QEMU_BOX_INITRD")]
    initrd: Option<PathBuf>,

    /// Raw root filesystem image
    #[arg(long, env = "QEMU_BOX_ROOTFS")]
    drive: PathBuf,

    /// Kill the guest after this long, e.g. `30s` or `2m`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Guest memory in megabytes
    #[arg(long, default_value_t = 512)]
    memory: usize,

    /// Number of vCPUs
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Disable hardware acceleration
    #[arg(long)]
    no_kvm: bool,

    /// Guest user to log in as
    #[arg(long, default_value = "root")]
    user: String,

    /// Password for a guest account, as `user:password` (repeatable)
    #[arg(long = "password", value_parser = parse_credential)]
    passwords: Vec<(String, String)>,

    /// How long to wait for the guest login prompt, e.g. `2m`
    #[arg(long, value_parser = humantime::parse_duration)]
    boot_timeout: Option<Duration>,

    /// Shell command to run in the guest
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn parse_credential(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(user, password)| (user.to_string(), password.to_string()))
        .ok_or_else(|| format!("expected user:password, got {:?}", s))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> qemu_box::Result<ExitCode> {
    let mut kernel = KernelImage::new("cli", &cli.kernel);
    if let Some(ref initrd) = cli.initrd {
        kernel = kernel.initrd(initrd);
    }

    let mut config = QemuConfig::new()
        .memory_mb(cli.memory)
        .cpus(cli.cpus)
        .timeout(cli.timeout.unwrap_or(Duration::ZERO));
    if cli.no_kvm {
        config = config.kvm(KvmMode::Off);
    }
    if let Some(boot_timeout) = cli.boot_timeout {
        config = config.boot_timeout(boot_timeout);
    }
    for (user, password) in cli.passwords {
        config = config.password(user, password);
    }

    let vm = QemuSystem::with_config(cli.arch, kernel, &cli.drive, config)?;
    info!(ssh = %vm.ssh_address(), "guest SSH forward");

    vm.start().await?;

    let command = cli.command.join(" ");
    // The hypervisor runs in its own process group and does not see the
    // terminal's SIGINT.
    let result = tokio::select! {
        result = vm.exec(&cli.user, &command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping guest");
            vm.stop().await;
            return Ok(ExitCode::from(130));
        }
    };
    let panicked = vm.kernel_panicked();
    vm.stop().await;

    if panicked {
        error!("guest kernel panicked");
    }

    let output = match result {
        Ok(output) => output,
        Err(Error::ConsoleClosed(_)) if vm.killed_by_watchdog() => {
            error!("guest killed by watchdog");
            return Ok(ExitCode::from(124));
        }
        Err(e) => return Err(e),
    };

    print!("{}", output.output);
    if !output.output.is_empty() && !output.output.ends_with('\n') {
        println!();
    }

    let code = u8::try_from(output.exit_code).unwrap_or(1);
    Ok(ExitCode::from(code))
}
