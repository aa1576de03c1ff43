//! Error types for qemu-box

use std::path::PathBuf;

use thiserror::Error;

use crate::vmm::arch::Arch;

/// Result type alias using qemu-box Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in qemu-box operations
#[derive(Error, Debug)]
pub enum Error {
    /// A kernel, initrd or drive path is missing or unreadable
    #[error("Invalid {kind} path {}: {reason}", path.display())]
    InvalidPath {
        kind: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// The architecture has no launch template
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Arch),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The hypervisor process could not be created
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// No expected prompt or sentinel arrived in time
    #[error("Timeout waiting for {0}")]
    ProtocolTimeout(String),

    /// The console produced output the protocol cannot parse
    #[error("Console protocol desync: {0}")]
    ProtocolDesync(String),

    /// The console stream ended (the hypervisor exited)
    #[error("Console closed while waiting for {0}")]
    ConsoleClosed(String),

    /// The guest refused the login
    #[error("Login rejected for user {0}")]
    LoginRejected(String),

    /// The guest command ran and exited non-zero
    #[error("Command exited with status {exit_code}: {}", output.trim_end())]
    CommandFailed { exit_code: i32, output: String },

    /// VM is not running
    #[error("VM is not running")]
    VmNotRunning,

    /// VM is already running
    #[error("VM is already running")]
    VmAlreadyRunning,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error was raised while validating a system descriptor.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath { .. } | Error::UnsupportedArchitecture(_) | Error::Config(_)
        )
    }

    /// Whether this error is a console protocol fault (as opposed to a guest
    /// command that ran and failed).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::ProtocolTimeout(_)
                | Error::ProtocolDesync(_)
                | Error::ConsoleClosed(_)
                | Error::LoginRejected(_)
        )
    }
}
