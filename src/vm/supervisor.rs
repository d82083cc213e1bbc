//! VM lifecycle supervision.
//!
//! ## Architecture
//!
//! ```text
//! VmSupervisor::start
//!     └─► ProcessLauncher::launch  →  hypervisor child process
//!             ├─► qmp::transport::bind  (stdio ⇄ QmpClient)
//!             ├─► connected watcher     (handshake done → Started)
//!             └─► exit watcher          (wait() → handle_exit)
//! ```
//!
//! The state machine:
//!
//! ```text
//! Stopped ──start()──► Starting ──handshake──► Started ──stop()──► Stopping ──exit──► Stopped
//!                         ▲                       │
//!                         └───exit code 0─────────┘        (automatic relaunch)
//!                                                 │
//!                                                 └──exit code ≠ 0──► Stopped  (terminal)
//! ```
//!
//! A zero exit outside a stop request is an unexpected-but-clean termination
//! (for example a guest-level reboot outside protocol control) and triggers a
//! relaunch of the same assembled command line. A non-zero exit typically
//! means a launch or configuration fault that would recur, so it is terminal.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::launcher::{LaunchOptions, ProcessLauncher, StdioMode};
use crate::qmp::{ClientError, QmpClient, QmpEvent, transport};

use super::{
    DefinitionError, DisplayInfo, SupervisorOptions, VNC_PORT_FLOOR, VmDefinition, VmState,
    vnc_socket_path,
};

const STATE_CHANNEL_CAPACITY: usize = 32;

/// Errors surfaced by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A state-gated operation was called outside its required state.
    /// Raised synchronously, with no side effects.
    #[error("operation requires the {required:?} state, VM is {actual:?}")]
    InvalidState { required: VmState, actual: VmState },

    /// The process launcher failed to produce a usable process.
    #[error("failed to launch hypervisor process")]
    Launch(#[source] anyhow::Error),

    /// The VM terminated before the awaited operation completed.
    #[error("VM terminated before the operation completed")]
    Terminated,

    /// A protocol-level failure, including structured errors reported by the
    /// hypervisor.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Supervises the lifecycle of one hypervisor subprocess.
///
/// Owns the VM state machine, assembles the launch command line, computes
/// display connection coordinates, restarts the process on clean unexpected
/// exits, and exposes the protocol command surface. Cheap to clone; all
/// clones share the same supervised instance.
///
/// Must be constructed inside a Tokio runtime: the supervisor spawns
/// background tasks for event handling and process watching.
#[derive(Clone)]
pub struct VmSupervisor {
    shared: Arc<Shared>,
}

struct Shared {
    definition: VmDefinition,
    options: SupervisorOptions,
    launcher: Box<dyn ProcessLauncher>,
    client: Arc<Mutex<QmpClient>>,
    state_tx: broadcast::Sender<VmState>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: VmState,
    /// Whether a live subprocess is tracked. Cleared before the relaunch
    /// decision on exit so a re-entrant `start` never observes a stale
    /// handle.
    process_tracked: bool,
    /// Assembled exactly once, on first start; reused verbatim afterwards.
    cmdline: Option<Vec<String>>,
    display: Option<DisplayInfo>,
    /// Launch counter; guards watcher callbacks from earlier launches.
    launch_generation: u64,
}

impl VmSupervisor {
    /// Create a supervisor for `definition`, launching processes through
    /// `launcher`.
    ///
    /// Validates the definition eagerly: a TCP display port below the VNC
    /// floor fails here, before any process can be spawned.
    pub fn new(
        definition: VmDefinition,
        launcher: Box<dyn ProcessLauncher>,
        options: SupervisorOptions,
    ) -> Result<Self, DefinitionError> {
        definition.validate()?;

        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            definition,
            options,
            launcher,
            client: Arc::new(Mutex::new(QmpClient::new())),
            state_tx,
            inner: Mutex::new(Inner {
                state: VmState::Stopped,
                process_tracked: false,
                cmdline: None,
                display: None,
                launch_generation: 0,
            }),
        });

        spawn_event_reactor(&shared);
        Ok(Self { shared })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        self.shared.inner.lock().unwrap().state
    }

    /// Display coordinates computed on first start; `None` before then.
    pub fn display_info(&self) -> Option<DisplayInfo> {
        self.shared.inner.lock().unwrap().display.clone()
    }

    /// The definition this supervisor was constructed with.
    pub fn definition(&self) -> &VmDefinition {
        &self.shared.definition
    }

    /// Subscribe to state-change notifications, delivered in transition
    /// order.
    pub fn subscribe_states(&self) -> broadcast::Receiver<VmState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to protocol events emitted by the guest. Subscriptions
    /// survive restarts of the underlying process.
    pub fn subscribe_events(&self) -> broadcast::Receiver<QmpEvent> {
        self.shared.client.lock().unwrap().subscribe_events()
    }

    /// Launch the hypervisor process and begin the protocol handshake.
    ///
    /// Transitions `Stopped → Starting`; the `Starting → Started` transition
    /// follows once the handshake completes, observed via
    /// [`VmSupervisor::subscribe_states`]. A no-op when a process is already
    /// tracked.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.process_tracked {
            debug!(id = %self.shared.definition.id, "start ignored, process already tracked");
            return Ok(());
        }

        self.shared.set_state(&mut inner, VmState::Starting);

        if inner.cmdline.is_none() {
            let (cmdline, display) =
                assemble_command(&self.shared.definition, &self.shared.options);
            info!(id = %self.shared.definition.id, cmdline = ?cmdline, "assembled launch command");
            inner.cmdline = Some(cmdline);
            inner.display = Some(display);
        }

        self.shared.launch_locked(&mut inner)
    }

    /// Stop the VM gracefully.
    ///
    /// Requires `Started`. Transitions to `Stopping`, asks the guest process
    /// to quit, and resolves only once the `Stopped` state has been
    /// observed.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut states = self.shared.state_tx.subscribe();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != VmState::Started {
                return Err(SupervisorError::InvalidState {
                    required: VmState::Started,
                    actual: inner.state,
                });
            }
            self.shared.set_state(&mut inner, VmState::Stopping);
        }

        // The process may already be going down; the exit path still drives
        // Stopping to Stopped, so a failed quit is not fatal here.
        if let Err(e) = self.send_quit() {
            debug!(id = %self.shared.definition.id, error = %e, "quit not sent, process already exiting");
        }
        self.await_state(&mut states, VmState::Stopped, None).await
    }

    /// Reboot the guest in place via the protocol's system-reset command.
    /// The process keeps running and the state remains `Started`.
    pub async fn reboot(&self) -> Result<(), SupervisorError> {
        self.execute("system_reset", None).await.map(|_| ())
    }

    /// Hard-reset the guest by terminating the process through the
    /// clean-exit path and relying on the automatic relaunch.
    ///
    /// Resolves once the fresh `Started` state is observed; fails with
    /// [`SupervisorError::Terminated`] if the relaunch dies instead.
    pub async fn reset(&self) -> Result<(), SupervisorError> {
        // Subscribe before the state check so an exit landing in between is
        // still observed below instead of hanging the await.
        let mut states = self.shared.state_tx.subscribe();
        self.require_started()?;
        if let Err(e) = self.send_quit() {
            debug!(id = %self.shared.definition.id, error = %e, "quit not sent, process already exiting");
        }
        self.await_state(&mut states, VmState::Started, Some(VmState::Stopped))
            .await
    }

    /// Execute an arbitrary protocol command and return its result payload.
    ///
    /// Requires `Started`. Protocol errors reported by the hypervisor
    /// surface unchanged as [`ClientError::Protocol`].
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, SupervisorError> {
        self.require_started()?;
        let rx = self
            .shared
            .client
            .lock()
            .unwrap()
            .execute(command, arguments)?;
        match rx.await {
            Ok(result) => result.map_err(SupervisorError::Client),
            Err(_) => Err(SupervisorError::Client(ClientError::ConnectionReset)),
        }
    }

    /// Run a human-readable monitor command and return its textual output.
    /// A null result is normalised to the empty string.
    pub async fn monitor_command(&self, line: &str) -> Result<String, SupervisorError> {
        let result = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": line })),
            )
            .await?;
        Ok(match result {
            Value::Null => String::new(),
            Value::String(text) => text,
            other => other.to_string(),
        })
    }

    /// Insert a new medium into a removable-media device.
    pub async fn change_removable_media(
        &self,
        device: &str,
        image_path: &str,
    ) -> Result<(), SupervisorError> {
        self.execute(
            "blockdev-change-medium",
            Some(json!({ "device": device, "filename": image_path })),
        )
        .await
        .map(|_| ())
    }

    /// Eject the medium from a removable-media device.
    pub async fn eject_removable_media(&self, device: &str) -> Result<(), SupervisorError> {
        self.execute("eject", Some(json!({ "device": device })))
            .await
            .map(|_| ())
    }

    fn require_started(&self) -> Result<(), SupervisorError> {
        let inner = self.shared.inner.lock().unwrap();
        if inner.state != VmState::Started {
            return Err(SupervisorError::InvalidState {
                required: VmState::Started,
                actual: inner.state,
            });
        }
        Ok(())
    }

    /// Ask the guest process to quit. Fire-and-forget: the process may die
    /// before a response is written, so the response is not awaited.
    fn send_quit(&self) -> Result<(), SupervisorError> {
        let _ = self.shared.client.lock().unwrap().execute("quit", None)?;
        Ok(())
    }

    async fn await_state(
        &self,
        states: &mut broadcast::Receiver<VmState>,
        target: VmState,
        failure: Option<VmState>,
    ) -> Result<(), SupervisorError> {
        loop {
            match states.recv().await {
                Ok(state) if state == target => return Ok(()),
                Ok(state) if Some(state) == failure => return Err(SupervisorError::Terminated),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "state stream lagged, checking current state");
                    let current = self.state();
                    if current == target {
                        return Ok(());
                    }
                    if Some(current) == failure {
                        return Err(SupervisorError::Terminated);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SupervisorError::Terminated);
                }
            }
        }
    }
}

impl Shared {
    /// The single state setter. Every transition is logged and broadcast so
    /// listeners observe the full ordered sequence.
    fn set_state(&self, inner: &mut Inner, state: VmState) {
        info!(id = %self.definition.id, from = ?inner.state, to = ?state, "state transition");
        inner.state = state;
        let _ = self.state_tx.send(state);
    }

    /// Launch the assembled command line and wire up transport and
    /// watchers. Caller holds the inner lock; on failure the state is set to
    /// `Stopped` before returning.
    fn launch_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<(), SupervisorError> {
        let Some(cmdline) = inner.cmdline.clone() else {
            error!(id = %self.definition.id, "launch requested with no assembled command line");
            self.set_state(inner, VmState::Stopped);
            return Err(SupervisorError::Launch(anyhow!(
                "no assembled command line"
            )));
        };

        let launch_options = LaunchOptions {
            stdin: StdioMode::Piped,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Null,
        };

        let mut process = match self.launcher.launch(&cmdline, &launch_options) {
            Ok(process) => process,
            Err(e) => {
                error!(id = %self.definition.id, error = %e, "hypervisor launch failed");
                self.set_state(inner, VmState::Stopped);
                return Err(SupervisorError::Launch(e));
            }
        };

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            error!(id = %self.definition.id, "launcher did not provide piped stdio");
            self.set_state(inner, VmState::Stopped);
            return Err(SupervisorError::Launch(anyhow!(
                "launcher did not provide piped stdio"
            )));
        };

        inner.process_tracked = true;
        inner.launch_generation += 1;
        let generation = inner.launch_generation;

        transport::bind(Arc::clone(&self.client), stdin, stdout);

        // Handshake watcher: promotes Starting to Started once the client
        // reports a completed capabilities negotiation.
        let mut connected = self.client.lock().unwrap().connected();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            while connected.changed().await.is_ok() {
                if *connected.borrow() {
                    shared.on_connected(generation);
                    return;
                }
            }
        });

        // Exit watcher: owns the process handle for its lifetime.
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let code = process.wait().await;
            shared.handle_exit(generation, code);
        });

        Ok(())
    }

    fn on_connected(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.launch_generation != generation {
            debug!("stale handshake notification");
            return;
        }
        if inner.state != VmState::Starting {
            warn!(state = ?inner.state, "handshake completed outside Starting");
            return;
        }
        info!(id = %self.definition.id, display = ?inner.display, "VM is up");
        self.set_state(&mut inner, VmState::Started);
    }

    /// Process-exit teardown. Order matters: unbind and reset the client
    /// first so stale transport data cannot correlate, then remove the
    /// rendezvous socket, then clear the tracked process before the
    /// relaunch decision.
    fn handle_exit(self: &Arc<Self>, generation: u64, code: i32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.launch_generation != generation {
            debug!("stale exit notification");
            return;
        }
        info!(id = %self.definition.id, code, state = ?inner.state, "hypervisor process exited");

        {
            let mut client = self.client.lock().unwrap();
            client.set_writer(None);
            client.reset();
        }

        // Best-effort: the socket may never have been created (TCP mode, or
        // exit before the hypervisor bound it).
        if let Some(DisplayInfo::Uds { path }) = &inner.display {
            let _ = std::fs::remove_file(path);
        }

        inner.process_tracked = false;

        match inner.state {
            VmState::Stopping => self.set_state(&mut inner, VmState::Stopped),
            _ if code == 0 => {
                info!(id = %self.definition.id, "clean exit outside a stop request, relaunching");
                self.set_state(&mut inner, VmState::Starting);
                if let Err(e) = self.launch_locked(&mut inner) {
                    error!(id = %self.definition.id, error = %e, "relaunch failed");
                }
            }
            _ => {
                error!(
                    id = %self.definition.id,
                    code,
                    "hypervisor exited with failure, not relaunching"
                );
                self.set_state(&mut inner, VmState::Stopped);
            }
        }
    }

    /// Issue a protocol command from the event reactor, logging instead of
    /// propagating failures.
    async fn issue(&self, command: &str) {
        let rx = match self.client.lock().unwrap().execute(command, None) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(command, error = %e, "failed to issue reactive command");
                return;
            }
        };
        match rx.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(command, error = %e, "reactive command rejected"),
            Err(_) => debug!(command, "connection reset before reactive command settled"),
        }
    }
}

/// Background task reacting to the two guest events the supervisor owns:
/// a halted guest (`STOP`) is rebooted rather than left wedged, and a guest
/// that just reset (`RESET`) is told to continue running.
fn spawn_event_reactor(shared: &Arc<Shared>) {
    let mut events = shared.client.lock().unwrap().subscribe_events();
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let started = shared.inner.lock().unwrap().state == VmState::Started;
            if !started {
                continue;
            }
            match event.name.as_str() {
                "STOP" => shared.issue("system_reset").await,
                "RESET" => shared.issue("cont").await,
                _ => {}
            }
        }
    });
}

/// Append protocol and display flags to the definition's base command line
/// and compute the matching display descriptor.
///
/// `-no-shutdown` keeps termination semantics under supervisor control: a
/// guest power-off halts the process instead of exiting it.
fn assemble_command(
    definition: &VmDefinition,
    options: &SupervisorOptions,
) -> (Vec<String>, DisplayInfo) {
    let mut args: Vec<String> = definition
        .command
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    args.push("-no-shutdown".to_string());
    if definition.snapshot {
        args.push("-snapshot".to_string());
    }
    args.push("-qmp".to_string());
    args.push("stdio".to_string());

    let use_tcp = definition.force_tcp
        || definition.vnc_host.is_some()
        || definition.vnc_port.is_some()
        || cfg!(windows);
    let display = if use_tcp {
        let host = definition
            .vnc_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = definition.vnc_port.unwrap_or(VNC_PORT_FLOOR);
        args.push("-vnc".to_string());
        args.push(format!("{host}:{}", port - VNC_PORT_FLOOR));
        DisplayInfo::Tcp { host, port }
    } else {
        let path = vnc_socket_path(&options.runtime_dir, &definition.id);
        args.push("-vnc".to_string());
        args.push(format!("unix:{}", path.display()));
        DisplayInfo::Uds { path }
    };

    (args, display)
}
