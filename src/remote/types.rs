//! Command runner abstraction shared by remote execution and provisioners.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::process::Command;
use tracing::debug;

use super::RemoteError;

/// Future returned by command and remote operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Upper bound on how long a command may run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandTimeout {
    /// The command is killed once the duration elapses.
    Bounded(Duration),
    /// The command may run indefinitely, for installs and provisioning.
    Unbounded,
}

/// A command to run on the local host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory for the process; inherits ours when unset.
    pub current_dir: Option<Utf8PathBuf>,
    /// Upper bound on the runtime.
    pub timeout: CommandTimeout,
}

impl CommandRequest {
    /// Creates an unbounded request for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: CommandTimeout::Unbounded,
        }
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn args(mut self, args: Vec<OsString>) -> Self {
        self.args = args;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: CommandTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the request, capturing stdout and stderr.
    ///
    /// A non-zero exit is reported through [`CommandOutput::code`], not as
    /// an error.
    fn run<'a>(&'a self, request: &'a CommandRequest) -> RemoteFuture<'a, CommandOutput>;
}

/// Real command runner that spawns processes on the host.
///
/// Children are killed when their future is dropped, so a timeout or a
/// cancelled stage never leaves `ssh`, `rsync`, or `scp` running.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> RemoteFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut command = Command::new(&request.program);
            command
                .args(&request.args)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = &request.current_dir {
                command.current_dir(dir);
            }
            debug!(command = %request.command_string(), "spawning command");

            let pending = command.output();
            let result = match request.timeout {
                CommandTimeout::Unbounded => pending.await,
                CommandTimeout::Bounded(limit) => tokio::time::timeout(limit, pending)
                    .await
                    .map_err(|_| RemoteError::Timeout {
                        program: request.program.clone(),
                        seconds: limit.as_secs(),
                    })?,
            };
            let output = result.map_err(|err| RemoteError::Spawn {
                program: request.program.clone(),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
