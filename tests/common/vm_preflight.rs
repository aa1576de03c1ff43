use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use qemu_box::Arch;

/// Guest images for tests that boot a real kernel
#[derive(Debug, Clone)]
pub struct GuestArtifacts {
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub rootfs: PathBuf,
}

/// Load guest artifact paths from the environment.
///
/// - QEMU_BOX_KERNEL: required
/// - QEMU_BOX_ROOTFS: required
/// - QEMU_BOX_INITRD: optional
pub fn artifacts_from_env() -> Option<GuestArtifacts> {
    let kernel = PathBuf::from(std::env::var_os("QEMU_BOX_KERNEL")?);
    let rootfs = PathBuf::from(std::env::var_os("QEMU_BOX_ROOTFS")?);
    let initrd = std::env::var_os("QEMU_BOX_INITRD").map(PathBuf::from);
    Some(GuestArtifacts {
        kernel,
        initrd,
        rootfs,
    })
}

pub fn require_kernel_artifacts(kernel: &Path, initrd: Option<&Path>) -> Result<(), String> {
    if !kernel.exists() {
        return Err(format!("kernel path does not exist: {}", kernel.display()));
    }
    if !kernel.is_file() {
        return Err(format!("kernel path is not a file: {}", kernel.display()));
    }
    if let Some(p) = initrd {
        if !p.exists() {
            return Err(format!("initrd path does not exist: {}", p.display()));
        }
        if !p.is_file() {
            return Err(format!("initrd path is not a file: {}", p.display()));
        }
    }
    Ok(())
}

/// Fail unless `qemu-system-<arch>` runs.
pub fn require_qemu_binary(arch: Arch) -> Result<(), String> {
    let binary = format!("qemu-system-{}", arch);
    let status = Command::new(&binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| format!("{binary} not runnable: {e}"))?;
    if !status.success() {
        return Err(format!("{binary} --version exited with {status}"));
    }
    Ok(())
}

/// Real artifacts plus a runnable QEMU, or `None` with the reason printed.
pub fn guest_or_skip(test: &str) -> Option<GuestArtifacts> {
    let Some(artifacts) = artifacts_from_env() else {
        eprintln!("skipping {test}: set QEMU_BOX_KERNEL, QEMU_BOX_ROOTFS and (optionally) QEMU_BOX_INITRD");
        return None;
    };
    if let Err(e) =
        require_kernel_artifacts(&artifacts.kernel, artifacts.initrd.as_deref())
            .and_then(|_| require_qemu_binary(Arch::X86_64))
    {
        eprintln!("skipping {test}: {e}");
        return None;
    }
    Some(artifacts)
}

/// Placeholder kernel and drive files that pass path validation
pub struct BootFiles {
    pub dir: tempfile::TempDir,
    pub kernel: PathBuf,
    pub drive: PathBuf,
}

pub fn boot_files() -> BootFiles {
    let dir = tempfile::tempdir().expect("create temp dir");
    let kernel = dir.path().join("bzImage");
    let drive = dir.path().join("rootfs.img");
    for path in [&kernel, &drive] {
        let mut file = std::fs::File::create(path).expect("create artifact");
        file.write_all(b"\0").expect("write artifact");
    }
    BootFiles { dir, kernel, drive }
}

/// Wrapper that runs `script` with `sh -c` in place of the hypervisor; the
/// hypervisor command line becomes the script's positional parameters.
pub fn shell_wrapper(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A serial console served by a shell loop: a login prompt, then a shell
/// that evaluates each line until `exit`. `$?` carries over from one line
/// to the next as in an interactive shell.
pub const SHELL_GUEST: &str = r#"
while :; do
  printf 'fakeguest login: '
  IFS= read -r user || exit 0
  PS1='$ '
  rc=0
  printf '%s' "$PS1"
  while IFS= read -r line; do
    [ "$line" = exit ] && break
    ( exit "$rc" )
    eval "$line" 2>&1
    rc=$?
    printf '%s' "$PS1"
  done
done
"#;
