//! Ephemeral TCP port allocation.
//!
//! Ports are obtained by binding a throwaway listener on `127.0.0.1:0`,
//! reading back the OS-assigned port and closing the listener again. The
//! ledger remembers every port handed out so two live instances never share
//! one, even if the OS recycles a number between allocation and use. Other
//! processes on the host can still grab a port in that window; that race is
//! accepted.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Arc;

use parking_lot::Mutex;

/// Base TCP port of VNC display `:0`.
pub const VNC_BASE_PORT: u16 = 5900;

/// How many OS-assigned ports to try before giving up on finding one that is
/// not already in the ledger.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("failed to bind probe socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("no unclaimed port after {0} attempts")]
    Exhausted(usize),
    #[error("port {0} is below the VNC base port and cannot map to a display")]
    DisplayOutOfRange(u16),
}

/// Process-wide ledger of claimed ports.
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone, Default)]
pub struct PortAllocator {
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free port.
    pub fn allocate_port(&self) -> Result<u16, AllocError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = probe_free_port()?;
            if self.claimed.lock().insert(port) {
                tracing::trace!(port, "port claimed");
                return Ok(port);
            }
        }
        Err(AllocError::Exhausted(MAX_ALLOCATION_ATTEMPTS))
    }

    /// Return a port to the pool. Releasing a port that is not claimed is a
    /// caller bug and only logged.
    pub fn release_port(&self, port: u16) {
        if !self.claimed.lock().remove(&port) {
            tracing::warn!(port, "released a port that was not claimed");
        }
    }

    /// Claim the full set of ports one emulator instance needs.
    ///
    /// On failure every port claimed so far is released again.
    pub fn allocate_lease(&self) -> Result<PortLease, AllocError> {
        let mut taken = Vec::with_capacity(5);
        let result = self.fill_lease(&mut taken);
        if result.is_err() {
            for port in taken {
                self.release_port(port);
            }
        }
        result
    }

    fn fill_lease(&self, taken: &mut Vec<u16>) -> Result<PortLease, AllocError> {
        for _ in 0..5 {
            taken.push(self.allocate_port()?);
        }
        Ok(PortLease {
            console: taken[0],
            bus: taken[1],
            ws: taken[2],
            vnc: taken[3],
            vnc_display: display_for_port(taken[3])?,
            vnc_ws: taken[4],
        })
    }

    /// Release every port held by `lease`.
    pub fn release_lease(&self, lease: &PortLease) {
        for port in lease.ports() {
            self.release_port(port);
        }
    }

    /// Whether `port` is currently claimed.
    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed.lock().contains(&port)
    }

    /// Number of claimed ports.
    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

/// Ports held by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    /// Emulator console serial port (boot log, readiness detection).
    pub console: u16,
    /// Emulator device-bus serial port, consumed by the companion runtime.
    pub bus: u16,
    /// Companion runtime device-protocol WebSocket port.
    pub ws: u16,
    /// Raw VNC port; only claimed so the display index stays unique.
    pub vnc: u16,
    /// VNC display index (`vnc - 5900`).
    pub vnc_display: u16,
    /// VNC-over-WebSocket port.
    pub vnc_ws: u16,
}

impl PortLease {
    /// Every claimed TCP port of the lease.
    pub fn ports(&self) -> [u16; 5] {
        [self.console, self.bus, self.ws, self.vnc, self.vnc_ws]
    }
}

/// Derive the VNC display index served on `port`.
pub fn display_for_port(port: u16) -> Result<u16, AllocError> {
    port.checked_sub(VNC_BASE_PORT)
        .ok_or(AllocError::DisplayOutOfRange(port))
}

fn probe_free_port() -> Result<u16, AllocError> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .map_err(AllocError::Bind)?;
    let port = listener.local_addr().map_err(AllocError::Bind)?.port();
    drop(listener);
    Ok(port)
}
