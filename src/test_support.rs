//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::experiment::SiteSpec;
use crate::files;
use crate::inventory::Machine;
use crate::provision::{
    ProvisionError, ProvisionFuture, ProvisionRequest, ProvisionedSite, Provisioner, machine_id,
};
use crate::registry::{
    ExperimentContext, ExperimentRunner, InstallContext, Installer, PluginError, PluginFuture,
    PluginRegistration,
};
use crate::remote::{
    CommandOutput, CommandRequest, CommandRunner, CommandTimeout, RemoteError, RemoteFuture,
    RemoteRunner,
};
use crate::settings::KisoSettings;
use crate::state::{EnvironmentPatch, SiteRecord};
use crate::transport::{PredicateReachability, Transport, select_transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings with every default filled in, as `kiso.toml` would leave them.
#[must_use]
pub fn settings() -> KisoSettings {
    KisoSettings {
        ssh_bin: String::from("ssh"),
        rsync_bin: String::from("rsync"),
        scp_bin: String::from("scp"),
        ssh_add_bin: String::from("ssh-add"),
        vagrant_bin: String::from("vagrant"),
        ssh_user: String::from("root"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        remote_root: String::from("kiso"),
        command_timeout_secs: 300,
        probe_timeout_secs: 5,
        package_retries: 3,
        package_retry_delay_secs: 10,
        max_workers: 5,
    }
}

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandRequest>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandRequest> {
        lock(&self.script).invocations.clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.script).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> RemoteFuture<'a, CommandOutput> {
        let next = {
            let mut script = lock(&self.script);
            script.invocations.push(request.clone());
            script.responses.pop_front()
        };
        Box::pin(async move {
            next.ok_or_else(|| RemoteError::Spawn {
                program: request.program.clone(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Fail,
    Respond(String),
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    machine: Option<String>,
    remaining: Option<usize>,
    outcome: Outcome,
}

impl Rule {
    fn matches(&self, machine: &str, text: &str) -> bool {
        text.contains(&self.pattern)
            && self.machine.as_deref().is_none_or(|id| id == machine)
            && self.remaining != Some(0)
    }
}

/// Transfer recorded by [`RecordingRemote`]: machine, source, destination.
pub type RecordedTransfer = (String, String, String);

#[derive(Debug, Default)]
struct Recording {
    execs: Vec<(String, String)>,
    pushes: Vec<RecordedTransfer>,
    pulls: Vec<RecordedTransfer>,
    rules: Vec<Rule>,
    transfer_failures: Vec<String>,
}

impl Recording {
    fn outcome(&mut self, machine: &str, command: &str) -> Option<&Outcome> {
        let failing = self
            .rules
            .iter()
            .position(|rule| matches!(rule.outcome, Outcome::Fail) && rule.matches(machine, command));
        let position = failing.or_else(|| {
            self.rules
                .iter()
                .position(|rule| rule.matches(machine, command))
        })?;
        let rule = self.rules.get_mut(position)?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        Some(&rule.outcome)
    }
}

/// [`RemoteRunner`] that records every call and answers from rules.
///
/// Commands succeed with empty output unless a rule says otherwise. Failure
/// rules take precedence over response rules.
#[derive(Clone, Debug, Default)]
pub struct RecordingRemote {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingRemote {
    /// Creates a remote where everything succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(&self, pattern: &str, machine: Option<&str>, remaining: Option<usize>, outcome: Outcome) {
        lock(&self.recording).rules.push(Rule {
            pattern: pattern.to_owned(),
            machine: machine.map(str::to_owned),
            remaining,
            outcome,
        });
    }

    /// Fails every command containing `pattern`.
    pub fn fail_when(&self, pattern: &str) {
        self.rule(pattern, None, None, Outcome::Fail);
    }

    /// Fails the first `times` commands containing `pattern`.
    pub fn fail_times(&self, pattern: &str, times: usize) {
        self.rule(pattern, None, Some(times), Outcome::Fail);
    }

    /// Fails commands containing `pattern` on machine `id` only.
    pub fn fail_on_machine(&self, id: &str, pattern: &str) {
        self.rule(pattern, Some(id), None, Outcome::Fail);
    }

    /// Answers commands containing `pattern` with `stdout`.
    pub fn respond_when(&self, pattern: &str, stdout: &str) {
        self.rule(pattern, None, None, Outcome::Respond(stdout.to_owned()));
    }

    /// Fails pushes and pulls whose source or destination contains
    /// `pattern`.
    pub fn fail_transfers_of(&self, pattern: &str) {
        lock(&self.recording)
            .transfer_failures
            .push(pattern.to_owned());
    }

    /// Commands run so far as `(machine, command)` pairs.
    #[must_use]
    pub fn exec_commands(&self) -> Vec<(String, String)> {
        lock(&self.recording).execs.clone()
    }

    /// Pushes so far.
    #[must_use]
    pub fn pushes(&self) -> Vec<RecordedTransfer> {
        lock(&self.recording).pushes.clone()
    }

    /// Pulls so far.
    #[must_use]
    pub fn pulls(&self) -> Vec<RecordedTransfer> {
        lock(&self.recording).pulls.clone()
    }

    fn transfer(&self, pulling: bool, record: RecordedTransfer) -> Result<(), RemoteError> {
        let mut recording = lock(&self.recording);
        let failing = recording
            .transfer_failures
            .iter()
            .any(|pattern| record.1.contains(pattern) || record.2.contains(pattern));
        let machine = record.0.clone();
        let command = format!("transfer {} {}", record.1, record.2);
        if pulling {
            recording.pulls.push(record);
        } else {
            recording.pushes.push(record);
        }
        if failing {
            return Err(RemoteError::command_failure(&machine, &command, &failure()));
        }
        Ok(())
    }
}

fn failure() -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: String::from("simulated failure"),
    }
}

const fn reachable(_: &Machine, _: IpAddr) -> bool {
    true
}

async fn any_transport(machine: &Machine) -> Result<Transport, RemoteError> {
    let probe = PredicateReachability::new(reachable);
    select_transport(machine, &probe)
        .await
        .map_err(RemoteError::from)
}

impl RemoteRunner for RecordingRemote {
    fn exec<'a>(
        &'a self,
        machine: &'a Machine,
        command: &'a str,
        _timeout: CommandTimeout,
    ) -> RemoteFuture<'a, CommandOutput> {
        let output = {
            let mut recording = lock(&self.recording);
            recording.execs.push((machine.id.clone(), command.to_owned()));
            match recording.outcome(&machine.id, command) {
                Some(Outcome::Fail) => failure(),
                Some(Outcome::Respond(stdout)) => CommandOutput {
                    code: Some(0),
                    stdout: stdout.clone(),
                    stderr: String::new(),
                },
                None => CommandOutput {
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                },
            }
        };
        Box::pin(async move { Ok(output) })
    }

    fn push<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a Utf8Path,
        destination: &'a str,
    ) -> RemoteFuture<'a, Transport> {
        Box::pin(async move {
            self.transfer(
                false,
                (machine.id.clone(), source.to_string(), destination.to_owned()),
            )?;
            any_transport(machine).await
        })
    }

    fn pull<'a>(
        &'a self,
        machine: &'a Machine,
        source: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, Transport> {
        Box::pin(async move {
            self.transfer(
                true,
                (machine.id.clone(), source.to_owned(), destination.to_string()),
            )?;
            any_transport(machine).await
        })
    }
}

/// Shared, ordered log of calls made to test doubles.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    /// Entries so far, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Entries starting with `prefix`.
    #[must_use]
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct FakeFailures {
    provision: BTreeSet<String>,
    teardown: BTreeSet<String>,
}

/// Provisioner that fabricates machines from the declared resources.
///
/// Machine `n` of request `r` in site `i` gets the address `10.i.r.n`.
/// Calls are logged as `provision:<site>`, `release:<site>`,
/// `teardown:<site>`, and `remove:<site>`.
#[derive(Clone, Debug)]
pub struct FakeProvisioner {
    kind: String,
    log: CallLog,
    failures: Arc<Mutex<FakeFailures>>,
}

impl FakeProvisioner {
    /// Creates a provisioner serving `kind` that logs to `log`.
    #[must_use]
    pub fn new(kind: &str, log: &CallLog) -> Self {
        Self {
            kind: kind.to_owned(),
            log: log.clone(),
            failures: Arc::default(),
        }
    }

    /// Makes provisioning of the site labelled `site` fail.
    pub fn fail_provision(&self, site: &str) {
        lock(&self.failures).provision.insert(site.to_owned());
    }

    /// Makes teardown of the site labelled `site` fail.
    pub fn fail_teardown(&self, site: &str) {
        lock(&self.failures).teardown.insert(site.to_owned());
    }

    fn machines(&self, site: &SiteSpec, index: usize, label: &str) -> Vec<Machine> {
        let octet = |value: usize| u8::try_from(value).unwrap_or(u8::MAX);
        let mut machines = Vec::new();
        for (position, request) in site.resources.machines.iter().enumerate() {
            let count = usize::try_from(request.number).unwrap_or_default();
            for n in 1..=count {
                let address = Ipv4Addr::new(10, octet(index), octet(position), octet(n));
                machines.push(
                    Machine::new(machine_id(&self.kind, label, &[position + 1, n]), &self.kind, label)
                        .with_roles(request.roles.iter().cloned())
                        .with_address(IpAddr::V4(address)),
                );
            }
        }
        machines
    }
}

impl Provisioner for FakeProvisioner {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "required": ["kind", "resources"]})
    }

    fn provision<'a>(&'a self, request: &'a ProvisionRequest<'a>) -> ProvisionFuture<'a, ProvisionedSite> {
        Box::pin(async move {
            self.log.push(format!("provision:{}", request.label));
            if lock(&self.failures).provision.contains(&request.label) {
                return Err(ProvisionError::Invalid {
                    site: request.label.clone(),
                    message: String::from("simulated provisioning failure"),
                });
            }
            files::ensure_dir(&request.state_dir)?;
            Ok(ProvisionedSite {
                machines: self.machines(request.site, request.index, &request.label),
                agent_keys: Vec::new(),
                backend: json!({"fake": true}),
                state_dir: Some(request.state_dir.clone()),
            })
        })
    }

    fn release_credentials<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("release:{}", record.label));
            Ok(())
        })
    }

    fn teardown<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("teardown:{}", record.label));
            if lock(&self.failures).teardown.contains(&record.label) {
                return Err(ProvisionError::Invalid {
                    site: record.label.clone(),
                    message: String::from("simulated teardown failure"),
                });
            }
            Ok(())
        })
    }

    fn remove_local_state<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            self.log.push(format!("remove:{}", record.label));
            if let Some(dir) = &record.state_dir {
                files::remove_dir_all(dir)?;
            }
            Ok(())
        })
    }
}

/// Section understood by [`fake_installer`] and [`fake_experiment`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FakeConfig {
    /// Targeted roles.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Whether the call fails after being logged.
    #[serde(default)]
    pub fail: bool,
}

fn fake_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "roles": {"type": "array", "items": {"type": "string"}},
            "fail": {"type": "boolean"}
        },
        "additionalProperties": false
    })
}

struct FakeInstaller {
    kind: String,
    config: FakeConfig,
    log: CallLog,
}

impl Installer for FakeInstaller {
    fn roles(&self) -> Vec<String> {
        self.config.roles.clone()
    }

    fn install<'a>(&'a self, ctx: &'a InstallContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            let machines = ctx.roles.require_all(&self.config.roles)?;
            self.log
                .push(format!("install:{}:{}", self.kind, machines.len()));
            if self.config.fail {
                return Err(PluginError::Failed {
                    message: format!("{} failed on purpose", self.kind),
                });
            }
            Ok(EnvironmentPatch::new().with(self.kind.clone(), "installed"))
        })
    }
}

/// Installer registration that logs `install:<kind>:<machines>`.
#[must_use]
pub fn fake_installer(kind: &str, log: &CallLog) -> PluginRegistration<dyn Installer> {
    let owned = kind.to_owned();
    let calls = log.clone();
    PluginRegistration::new(kind, fake_schema(), move |config: FakeConfig| -> Box<dyn Installer> {
        Box::new(FakeInstaller {
            kind: owned.clone(),
            config,
            log: calls.clone(),
        })
    })
}

struct FakeExperiment {
    config: FakeConfig,
    log: CallLog,
}

impl ExperimentRunner for FakeExperiment {
    fn roles(&self) -> Vec<String> {
        self.config.roles.clone()
    }

    fn run<'a>(&'a self, ctx: &'a ExperimentContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            self.log.push(format!("run:{}:{}", ctx.name, ctx.iteration));
            files::write(
                &ctx.result_dir.join("iteration.txt"),
                &format!("{}\n", ctx.iteration),
            )?;
            if self.config.fail {
                return Err(PluginError::Failed {
                    message: format!("{} failed on purpose", ctx.name),
                });
            }
            Ok(EnvironmentPatch::new().with(format!("{}-last", ctx.name), ctx.iteration))
        })
    }
}

/// Experiment registration that logs `run:<name>:<iteration>` and writes
/// `iteration.txt` into the result directory.
#[must_use]
pub fn fake_experiment(kind: &str, log: &CallLog) -> PluginRegistration<dyn ExperimentRunner> {
    let calls = log.clone();
    PluginRegistration::new(
        kind,
        fake_schema(),
        move |config: FakeConfig| -> Box<dyn ExperimentRunner> {
            Box::new(FakeExperiment {
                config,
                log: calls.clone(),
            })
        },
    )
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    /// A `None` value removes the variable.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(text) => env::set_var(key, text),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
