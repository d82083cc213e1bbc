//! VM supervision module for vmwarden.
//!
//! Defines the data model shared by the supervisor: the immutable VM
//! definition, the lifecycle state enumeration, and the display descriptor
//! computed during command-line assembly.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Lowest TCP port the VNC protocol maps to display number 0.
pub const VNC_PORT_FLOOR: u16 = 5900;

/// Filename prefix for per-VM rendezvous sockets in the runtime directory.
pub(crate) const SOCKET_PREFIX: &str = "vmwarden";

/// Configuration rejected at supervisor construction time.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// A configured VNC port falls below the protocol's display numbering
    /// floor and can never correspond to a valid display.
    #[error("vnc port {0} is below the VNC display floor ({VNC_PORT_FLOOR})")]
    VncPortTooLow(u16),
}

/// Immutable description of a single VM.
///
/// Passed to [`supervisor::VmSupervisor::new`]. The `command` field is the
/// base hypervisor command line; the supervisor appends its own protocol and
/// display flags exactly once, on first start.
#[derive(Debug, Clone)]
pub struct VmDefinition {
    /// Stable identifier, used in the rendezvous socket filename.
    pub id: String,

    /// Base hypervisor command line (program followed by arguments,
    /// whitespace-separated).
    pub command: String,

    /// When `true`, the ephemeral-disk flag is appended so guest disk writes
    /// are discarded on termination.
    pub snapshot: bool,

    /// Force a TCP display endpoint even on platforms where a local socket
    /// would be preferred.
    pub force_tcp: bool,

    /// Host for the TCP display endpoint. Setting it selects TCP mode;
    /// defaults to `127.0.0.1` once TCP is in effect.
    pub vnc_host: Option<String>,

    /// Port for the TCP display endpoint. Setting it selects TCP mode. Must
    /// be at least [`VNC_PORT_FLOOR`]; defaults to it once TCP is in effect.
    pub vnc_port: Option<u16>,
}

impl VmDefinition {
    /// A definition with the given id and base command and all optional
    /// behaviour disabled.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            snapshot: false,
            force_tcp: false,
            vnc_host: None,
            vnc_port: None,
        }
    }

    /// Validate the definition. Called by the supervisor constructor so a
    /// bad configuration can never partially launch a process.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if let Some(port) = self.vnc_port {
            if port < VNC_PORT_FLOOR {
                return Err(DefinitionError::VncPortTooLow(port));
            }
        }
        Ok(())
    }
}

/// Observed lifecycle state of a supervised VM.
///
/// Exactly one supervisor owns one state value at a time; every transition
/// flows through a single setter that also broadcasts the new state, so
/// subscribers observe transitions in order with none skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No process is tracked.
    Stopped,
    /// A process has been launched and the protocol handshake is underway.
    Starting,
    /// The handshake completed; the command surface is available.
    Started,
    /// A stop was requested and we are waiting for process exit.
    Stopping,
}

/// Where the VM's remote display can be reached.
///
/// Computed during command-line assembly; `None` before the first start,
/// frozen afterwards, and reused verbatim across automatic relaunches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayInfo {
    /// Local-filesystem rendezvous socket.
    Uds { path: PathBuf },
    /// TCP endpoint.
    Tcp { host: String, port: u16 },
}

/// Supervisor construction options.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory for per-VM rendezvous sockets. Defaults to the OS temporary
    /// directory; override for test isolation or multiple concurrent
    /// instances.
    pub runtime_dir: PathBuf,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir(),
        }
    }
}

/// Rendezvous socket path for a VM id: `<runtime_dir>/vmwarden-<id>-vnc`.
pub(crate) fn vnc_socket_path(runtime_dir: &Path, id: &str) -> PathBuf {
    runtime_dir.join(format!("{SOCKET_PREFIX}-{id}-vnc"))
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use supervisor::{SupervisorError, VmSupervisor};
