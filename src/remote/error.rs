//! Errors surfaced by command execution and file transfer.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced while running commands or transferring files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a bounded command outlives its timeout.
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Timeout that elapsed, in seconds.
        seconds: u64,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("`{command}` on {target} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Machine identifier, or `local` for host commands.
        target: String,
        /// Abbreviated command that failed.
        command: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when no transport can reach a machine.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RemoteError {
    /// Builds a [`RemoteError::CommandFailure`], abbreviating long commands
    /// to their first line.
    #[must_use]
    pub fn command_failure(
        target: &str,
        command: &str,
        output: &super::CommandOutput,
    ) -> Self {
        Self::CommandFailure {
            target: target.to_owned(),
            command: abbreviate(command),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    /// Whether retrying the same command could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailure { .. } | Self::Timeout { .. })
    }
}

const COMMAND_SUMMARY_CHARS: usize = 80;

fn abbreviate(command: &str) -> String {
    let first_line = command.lines().next().unwrap_or_default();
    let mut summary: String = first_line.chars().take(COMMAND_SUMMARY_CHARS).collect();
    if summary.len() < command.len() {
        summary.push_str(" ...");
    }
    summary
}
