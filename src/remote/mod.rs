//! Remote command execution and file transfer over SSH.
//!
//! [`RemoteRunner`] is the capability every stage uses to reach machines.
//! [`Remote`] implements it with the system `ssh`, `rsync`, and `scp`
//! clients, choosing the transfer primitive per machine through
//! [`crate::transport::select_transport`].

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use camino::Utf8Path;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::experiment::Script;
use crate::inventory::Machine;
use crate::settings::{KisoSettings, SettingsError};
use crate::transport::{Reachability, Transport, TransportError, TransportKind, select_transport};

mod args;
mod error;
mod types;
mod util;

pub use error::RemoteError;
pub use types::{
    CommandOutput, CommandRequest, CommandRunner, CommandTimeout, ProcessCommandRunner,
    RemoteFuture,
};
pub use util::{as_root, expand_tilde, quote, remote_path};

/// Capability for reaching provisioned machines.
pub trait RemoteRunner: Send + Sync {
    /// Runs `command` through a login shell on `machine`.
    ///
    /// A non-zero exit is reported through [`CommandOutput::code`].
    fn exec<'a>(
        &'a self,
        machine: &'a Machine,
        command: &'a str,
        timeout: CommandTimeout,
    ) -> RemoteFuture<'a, CommandOutput>;

    /// Copies the local `source` to `destination` on `machine` and returns
    /// the transport used.
    fn push<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a Utf8Path,
        destination: &'a str,
    ) -> RemoteFuture<'a, Transport>;

    /// Copies the remote `source` into the local directory `destination` and
    /// returns the transport used.
    fn pull<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, Transport>;
}

/// How often and how patiently a failing command is retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy making at least one attempt.
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Total attempts, including the first.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// [`RemoteRunner`] backed by local `ssh`, `rsync`, and `scp` processes.
#[derive(Clone, Debug)]
pub struct Remote<R: CommandRunner, P: Reachability> {
    settings: KisoSettings,
    runner: R,
    reachability: P,
}

impl<R: CommandRunner, P: Reachability> Remote<R, P> {
    /// Creates a remote runner after validating `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] when validation fails.
    pub fn new(settings: KisoSettings, runner: R, reachability: P) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            settings,
            runner,
            reachability,
        })
    }

    /// Returns a reference to the underlying settings.
    #[must_use]
    pub const fn settings(&self) -> &KisoSettings {
        &self.settings
    }

    async fn transfer(
        &self,
        machine: &Machine,
        build: impl FnOnce(&Self, Transport) -> CommandRequest,
    ) -> Result<Transport, RemoteError> {
        let transport = select_transport(machine, &self.reachability).await?;
        let request = build(self, transport);
        debug!(machine = %machine.id, transport = %transport.kind, "transferring files");
        let output = self.runner.run(&request).await?;
        if output.is_success() {
            return Ok(transport);
        }
        Err(RemoteError::command_failure(
            &machine.id,
            &request.program,
            &output,
        ))
    }

    fn transfer_request(&self, transport: Transport, args: Vec<std::ffi::OsString>) -> CommandRequest {
        let program = match transport.kind {
            TransportKind::Rsync => &self.settings.rsync_bin,
            TransportKind::Scp => &self.settings.scp_bin,
        };
        CommandRequest::new(program.clone())
            .args(args)
            .timeout(CommandTimeout::Unbounded)
    }
}

impl<R: CommandRunner, P: Reachability> RemoteRunner for Remote<R, P> {
    fn exec<'a>(
        &'a self,
        machine: &'a Machine,
        command: &'a str,
        timeout: CommandTimeout,
    ) -> RemoteFuture<'a, CommandOutput> {
        Box::pin(async move {
            let address = machine
                .ssh_address()
                .ok_or_else(|| TransportError::NoAddresses {
                    machine: machine.id.clone(),
                })?;
            let request = CommandRequest::new(self.settings.ssh_bin.clone())
                .args(args::ssh_args(&self.settings, machine, address, command))
                .timeout(timeout);
            self.runner.run(&request).await
        })
    }

    fn push<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a Utf8Path,
        destination: &'a str,
    ) -> RemoteFuture<'a, Transport> {
        Box::pin(self.transfer(machine, move |remote, transport| {
            let args = match transport.kind {
                TransportKind::Rsync => args::rsync_push_args(
                    &remote.settings,
                    machine,
                    transport.address,
                    source,
                    destination,
                ),
                TransportKind::Scp => args::scp_push_args(
                    &remote.settings,
                    machine,
                    transport.address,
                    source,
                    destination,
                ),
            };
            remote.transfer_request(transport, args)
        }))
    }

    fn pull<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, Transport> {
        Box::pin(self.transfer(machine, move |remote, transport| {
            let args = match transport.kind {
                TransportKind::Rsync => args::rsync_pull_args(
                    &remote.settings,
                    machine,
                    transport.address,
                    source,
                    destination,
                ),
                TransportKind::Scp => args::scp_pull_args(
                    &remote.settings,
                    machine,
                    transport.address,
                    source,
                    destination,
                ),
            };
            remote.transfer_request(transport, args)
        }))
    }
}

/// Runs `command` and converts a non-zero exit into an error.
///
/// # Errors
///
/// Returns [`RemoteError::CommandFailure`] on a non-zero exit, or any error
/// from [`RemoteRunner::exec`].
pub async fn exec_checked(
    remote: &dyn RemoteRunner,
    machine: &Machine,
    command: &str,
    timeout: CommandTimeout,
) -> Result<CommandOutput, RemoteError> {
    let output = remote.exec(machine, command, timeout).await?;
    if output.is_success() {
        return Ok(output);
    }
    Err(RemoteError::command_failure(&machine.id, command, &output))
}

/// Runs `command`, retrying failures and timeouts per `policy`.
///
/// # Errors
///
/// Returns the last error once the attempts are exhausted, or immediately
/// for errors that retrying cannot fix.
pub async fn exec_with_retry(
    remote: &dyn RemoteRunner,
    machine: &Machine,
    command: &str,
    timeout: CommandTimeout,
    policy: RetryPolicy,
) -> Result<CommandOutput, RemoteError> {
    let mut attempt = 1;
    loop {
        match exec_checked(remote, machine, command, timeout).await {
            Ok(output) => return Ok(output),
            Err(err) if attempt < policy.attempts() && err.is_retryable() => {
                warn!(machine = %machine.id, attempt, error = %err, "command failed; retrying");
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Applies `op` to every machine with at most `max_workers` in flight.
///
/// Every operation runs to completion. Results are reported in input order,
/// so the returned error is that of the first failing machine.
///
/// # Errors
///
/// Returns the first error in input order.
pub async fn for_each_machine<'m, F, Fut, T, E>(
    machines: &[&'m Machine],
    max_workers: usize,
    op: F,
) -> Result<Vec<T>, E>
where
    F: Fn(&'m Machine) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    // Futures are built before streaming: a lazily mapped stream over
    // borrowed machines is not provably `Send` inside boxed plugin futures.
    let pending: Vec<_> = machines
        .iter()
        .copied()
        .enumerate()
        .map(|(index, machine)| {
            let operation = op(machine);
            async move { (index, operation.await) }
        })
        .collect();
    let mut results: Vec<(usize, Result<T, E>)> = stream::iter(pending)
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

/// Renders the shell command that runs `script` in `working_dir` with
/// `variables` exported.
#[must_use]
pub fn script_command(
    script: &Script,
    working_dir: &str,
    variables: &BTreeMap<String, Value>,
) -> String {
    let mut command = format!("cd {} && ", quote(working_dir));
    for (name, value) in variables {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        command.push_str(&format!("export {name}={}; ", quote(&rendered)));
    }
    command.push_str(&format!(
        "{} -c {}",
        quote(&script.executable),
        quote(&script.script)
    ));
    command
}

/// Runs `script` on every machine and returns each machine's output in
/// input order.
///
/// # Errors
///
/// Returns the first failure in input order once every machine finished.
pub async fn run_script<'m>(
    remote: &dyn RemoteRunner,
    machines: &[&'m Machine],
    command: &str,
    max_workers: usize,
) -> Result<Vec<(&'m Machine, CommandOutput)>, RemoteError> {
    for_each_machine(machines, max_workers, |machine| async move {
        let output = exec_checked(remote, machine, command, CommandTimeout::Unbounded).await?;
        Ok::<_, RemoteError>((machine, output))
    })
    .await
}
