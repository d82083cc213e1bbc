//! Pluggable process-launcher abstraction.
//!
//! The supervisor never spawns processes itself. It depends on a
//! [`ProcessLauncher`] strategy supplied at construction, which yields
//! [`ManagedProcess`] handles exposing byte streams and lifecycle signals.
//! [`TokioLauncher`] is the default implementation for composition roots;
//! tests substitute a scripted launcher to exercise the supervisor without a
//! real hypervisor binary.
//!
//! Sandboxing and resource limiting are deliberately left to whoever
//! implements the launcher.

use std::io;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{error, info};

/// Boxed writable byte stream for a process's stdin.
pub type ProcessStdin = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed readable byte stream for a process's stdout or stderr.
pub type ProcessStdout = Box<dyn AsyncRead + Send + Unpin>;

/// Disposition of one stdio stream of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Attach a pipe readable/writable from the host side.
    #[default]
    Piped,
    /// Inherit the supervising process's stream.
    Inherit,
    /// Discard the stream.
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Stdio dispositions requested for a launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

/// A live handle to a launched process.
///
/// Stream accessors yield each stream at most once; subsequent calls return
/// `None`. Dropping the handle releases all associated resources.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Take ownership of the process's stdin stream, if piped.
    fn take_stdin(&mut self) -> Option<ProcessStdin>;

    /// Take ownership of the process's stdout stream, if piped.
    fn take_stdout(&mut self) -> Option<ProcessStdout>;

    /// Take ownership of the process's stderr stream, if piped.
    fn take_stderr(&mut self) -> Option<ProcessStdout>;

    /// Wait for the process to exit and return its exit code. Deaths by
    /// signal are reported as `128 + signal`.
    async fn wait(&mut self) -> i32;

    /// Forcibly terminate the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Strategy for launching hypervisor processes.
pub trait ProcessLauncher: Send + Sync {
    /// Launch `command` (program followed by arguments) with the given stdio
    /// dispositions.
    fn launch(
        &self,
        command: &[String],
        options: &LaunchOptions,
    ) -> anyhow::Result<Box<dyn ManagedProcess>>;
}

// ---------------------------------------------------------------------------
// Default implementation over tokio::process
// ---------------------------------------------------------------------------

/// Default launcher backed by [`tokio::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl ManagedProcess for TokioProcess {
    fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as ProcessStdin)
    }

    fn take_stdout(&mut self) -> Option<ProcessStdout> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as ProcessStdout)
    }

    fn take_stderr(&mut self) -> Option<ProcessStdout> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as ProcessStdout)
    }

    async fn wait(&mut self) -> i32 {
        match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!(error = %e, "wait on child process failed");
                -1
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(
        &self,
        command: &[String],
        options: &LaunchOptions,
    ) -> anyhow::Result<Box<dyn ManagedProcess>> {
        let (program, args) = command
            .split_first()
            .context("empty command line")?;

        let child = Command::new(program)
            .args(args)
            .stdin(options.stdin.to_stdio())
            .stdout(options.stdout.to_stdio())
            .stderr(options.stderr.to_stdio())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        info!(program = %program, pid = ?child.id(), "process spawned");
        Ok(Box::new(TokioProcess { child }))
    }
}

/// Normalise an [`std::process::ExitStatus`] to a plain exit code.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
