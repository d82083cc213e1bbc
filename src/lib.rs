//! vmwarden: hypervisor subprocess supervision over the QMP machine protocol.
//!
//! Supervises the lifecycle of a virtual-machine hypervisor process and
//! controls it over QMP carried on the child's stdio:
//!
//! ```text
//! VmSupervisor ──ProcessLauncher::launch──► hypervisor process
//!      │                                        │ stdio
//!      │                              qmp::transport (reader/writer tasks)
//!      │                                        │
//!      ├── state machine  ◄──connected/exit──  QmpClient
//!      └── command surface ──execute/events──►  │
//! ```
//!
//! The supervisor appends the protocol and display flags to the configured
//! command line, performs the QMP handshake, restarts the process on clean
//! unexpected exits, and exposes reboot/reset/stop plus removable-media and
//! monitor passthrough commands. Process spawning is pluggable through
//! [`ProcessLauncher`]; [`TokioLauncher`] is the stock implementation.
//!
//! ```no_run
//! use vmwarden::{SupervisorOptions, TokioLauncher, VmDefinition, VmSupervisor};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = VmDefinition::new("demo", "qemu-system-x86_64 -m 512");
//! let vm = VmSupervisor::new(
//!     definition,
//!     Box::new(TokioLauncher),
//!     SupervisorOptions::default(),
//! )?;
//! vm.start()?;
//! # Ok(())
//! # }
//! ```

pub mod launcher;
pub mod logging;
pub mod qmp;
pub mod vm;

pub use launcher::{
    LaunchOptions, ManagedProcess, ProcessLauncher, ProcessStdin, ProcessStdout, StdioMode,
    TokioLauncher,
};
pub use qmp::{ClientError, EventTimestamp, QmpClient, QmpError, QmpEvent};
pub use vm::{
    DefinitionError, DisplayInfo, SupervisorError, SupervisorOptions, VNC_PORT_FLOOR,
    VmDefinition, VmState, VmSupervisor,
};
