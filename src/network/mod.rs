//! Host-side networking for QEMU guests
//!
//! This module handles:
//! - Ephemeral port reservation for host forwards
//! - User-mode (SLIRP) network arguments with host->guest port forwards

use std::net::TcpListener;

use tracing::debug;

use crate::Result;

/// Guest port the SSH forward points at
pub const GUEST_SSH_PORT: u16 = 22;

/// Reserve a free local TCP address.
///
/// Binds `127.0.0.1:0`, reads back the port the OS picked, and releases the
/// listener before returning `"127.0.0.1:<port>"`. The address is listenable
/// at the moment of the call; another process may still grab it before the
/// hypervisor binds it, which is inherent to ephemeral port allocation.
pub fn reserve_free_address() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    debug!(%addr, "reserved ephemeral address");
    Ok(addr.to_string())
}

/// A host address forwarded to a guest TCP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostForward {
    /// Host side, `host:port`
    pub host: String,
    /// Guest side port
    pub guest_port: u16,
}

/// User-mode network configuration for a guest
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// NIC model, e.g. `virtio-net-pci` (QEMU default when unset)
    pub model: Option<String>,
    /// Host port forwards
    pub forwards: Vec<HostForward>,
}

impl NetworkConfig {
    /// Create a user-mode network without forwards
    pub fn user() -> Self {
        Self::default()
    }

    /// Set the NIC model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add a port forward
    pub fn forward(mut self, host: impl Into<String>, guest_port: u16) -> Self {
        self.forwards.push(HostForward {
            host: host.into(),
            guest_port,
        });
        self
    }

    /// Render the `-nic` arguments
    pub fn to_args(&self) -> Vec<String> {
        let mut nic = String::from("user");
        if let Some(ref model) = self.model {
            nic.push_str(",model=");
            nic.push_str(model);
        }
        for fwd in &self.forwards {
            nic.push_str(&format!(",hostfwd=tcp:{}-:{}", fwd.host, fwd.guest_port));
        }
        vec!["-nic".to_string(), nic]
    }
}
