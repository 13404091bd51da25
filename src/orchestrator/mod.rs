//! Lifecycle orchestration: `check`, `up`, `run`, and `down`.
//!
//! Stages run sequentially in document order. State is saved after every
//! completed step, so an interrupted command resumes after the last step
//! that finished and never claims a step it did not complete.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bootstrap::bootstrap;
use crate::collect::{Collection, CollectionWarning, collect_outputs};
use crate::experiment::{ExperimentEntry, ExperimentSpec, Script};
use crate::files;
use crate::hostmap::{HOSTS_FILE_KEY, HostMap};
use crate::inventory::{Machine, RoleMap};
use crate::provision::{ProvisionRequest, ProvisionerRegistry, site_state_dir};
use crate::registry::{
    ExperimentContext, ExperimentRunner, InstallContext, Installer, PluginCategory, PluginError,
    ResolvedPlugin,
};
use crate::remote::{
    CommandTimeout, RemoteRunner, exec_checked, for_each_machine, quote, remote_path, run_script,
    script_command,
};
use crate::settings::LifecycleOptions;
use crate::state::{
    Environment, EnvironmentPatch, InstalledKinds, LifecycleState, SiteRecord, State, StateStore,
};

mod check;
mod error;

pub use check::{CheckedExperiment, check};
pub use error::{
    ExecutionStep, LifecycleError, SiteTeardownFailure, TeardownError, TeardownStep,
};

/// Name of the local host-map copy inside the output directory.
pub const HOSTS_FILE_NAME: &str = "hosts";

/// Directory under the output directory receiving experiment results.
pub const RESULTS_DIR_NAME: &str = "results";

/// What `up` did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpOutcome {
    /// Every stage had already completed; nothing was touched.
    AlreadyUp,
    /// The missing stages ran to completion.
    Completed,
}

/// Flags of `run`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunOptions {
    /// Re-run iterations that already completed.
    pub force: bool,
    /// Record a failing experiment and continue with the next one.
    pub keep_going: bool,
}

/// What `run` did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Iterations that ran and completed, as `(experiment, iteration)`.
    pub completed: Vec<(String, u32)>,
    /// Iterations skipped because an earlier run completed them.
    pub skipped: Vec<(String, u32)>,
    /// Experiments that failed under `keep_going`, with the cause.
    pub failures: Vec<(String, String)>,
    /// Outputs that could not be collected.
    pub warnings: Vec<CollectionWarning>,
}

impl RunSummary {
    /// Whether every experiment succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What `down` did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownOutcome {
    /// No state file existed.
    NothingProvisioned,
    /// Sites were torn down.
    TornDown {
        /// Number of sites removed.
        sites: usize,
    },
}

/// Remote working directory of `experiment` under `remote_root`.
#[must_use]
pub fn remote_working_dir(remote_root: &str, experiment: &str) -> String {
    format!("{}/{experiment}", remote_root.trim_end_matches('/'))
}

fn settle<T>(
    store: &StateStore,
    state: &mut State,
    result: Result<T, LifecycleError>,
) -> Result<T, LifecycleError> {
    result.map_err(|err| {
        state.record_failure(err.failed_stage(), err.to_string());
        if let Err(save) = store.save(state) {
            warn!(error = %save, "failed to record the failure in state");
        }
        err
    })
}

struct InstallStage<'p> {
    category: PluginCategory,
    plugins: &'p [ResolvedPlugin<dyn Installer>],
    completes: LifecycleState,
    installed: fn(&mut InstalledKinds) -> &mut BTreeSet<String>,
}

const fn software_kinds(installed: &mut InstalledKinds) -> &mut BTreeSet<String> {
    &mut installed.software
}

const fn deployment_kinds(installed: &mut InstalledKinds) -> &mut BTreeSet<String> {
    &mut installed.deployment
}

struct Iteration<'a> {
    index: usize,
    iteration: u32,
    entry: &'a ExperimentEntry,
    plugin: &'a ResolvedPlugin<dyn ExperimentRunner>,
    roles: &'a RoleMap,
    environment: &'a Environment,
    variables: &'a BTreeMap<String, Value>,
    working_dir: &'a Utf8Path,
    remote_dir: &'a str,
    result_dir: &'a Utf8Path,
}

impl Iteration<'_> {
    fn failed(&self, step: ExecutionStep, source: PluginError) -> LifecycleError {
        LifecycleError::Execution {
            experiment: self.entry.name.clone(),
            iteration: self.iteration,
            step,
            source: Box::new(source),
        }
    }
}

struct RunScope<'a> {
    spec: &'a ExperimentSpec,
    store: &'a StateStore,
    roles: &'a RoleMap,
    remote_dir: &'a str,
    force: bool,
}

/// Drives the lifecycle of one output directory.
pub struct Orchestrator {
    provisioners: ProvisionerRegistry,
    remote: Arc<dyn RemoteRunner>,
    options: LifecycleOptions,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provisioners", &self.provisioners)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator using `provisioners` for sites and `remote`
    /// to reach machines.
    #[must_use]
    pub const fn new(
        provisioners: ProvisionerRegistry,
        remote: Arc<dyn RemoteRunner>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            provisioners,
            remote,
            options,
        }
    }

    /// Provisioners serving the sites.
    #[must_use]
    pub const fn provisioners(&self) -> &ProvisionerRegistry {
        &self.provisioners
    }

    const fn command_timeout(&self) -> CommandTimeout {
        CommandTimeout::Bounded(self.options.command_timeout)
    }

    /// Provisions every site, distributes the host map, bootstraps every
    /// machine, then installs software and deployment plugins.
    ///
    /// Without `force`, sites and kinds recorded by an earlier `up` are
    /// skipped, and a fully deployed state is left untouched. With `force`
    /// the previous state is discarded and a new generation starts.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure. State keeps every step completed
    /// before it, plus the failure.
    pub async fn up(
        &self,
        checked: &CheckedExperiment,
        store: &StateStore,
        force: bool,
    ) -> Result<UpOutcome, LifecycleError> {
        let mut state = if force {
            store.discard()?;
            State::new()
        } else {
            store.load()?
        };
        let spec = checked.spec();
        let every_site_recorded = (0..spec.sites.len()).all(|index| state.site(index).is_some());
        if state.stage.is_at_least(LifecycleState::Deployed) && every_site_recorded {
            info!(output = %store.output_dir(), "experiment is already up");
            return Ok(UpOutcome::AlreadyUp);
        }
        let result = self.bring_up(checked, store, &mut state, force).await;
        settle(store, &mut state, result).map(|()| UpOutcome::Completed)
    }

    async fn bring_up(
        &self,
        checked: &CheckedExperiment,
        store: &StateStore,
        state: &mut State,
        force: bool,
    ) -> Result<(), LifecycleError> {
        let spec = checked.spec();
        state.experiment = Some(spec.name.clone());
        state.working_dir = Some(spec.working_dir.clone());
        state.remote_working_dir = Some(remote_working_dir(&self.options.remote_root, &spec.name));
        state.advance(LifecycleState::Checked);
        store.save(state)?;

        self.provision_sites(spec, store, state, force).await?;
        let roles = RoleMap::resolve(&state.machines());
        let host_map = self.distribute_host_map(&roles, store, state).await?;
        self.bootstrap_machines(&roles, store, state).await?;

        let stages = [
            InstallStage {
                category: PluginCategory::Software,
                plugins: &checked.plugins().software,
                completes: LifecycleState::SoftwareInstalled,
                installed: software_kinds,
            },
            InstallStage {
                category: PluginCategory::Deployment,
                plugins: &checked.plugins().deployment,
                completes: LifecycleState::Deployed,
                installed: deployment_kinds,
            },
        ];
        for stage in &stages {
            self.install(stage, spec, &roles, &host_map, store, state)
                .await?;
        }
        info!(experiment = %spec.name, machines = roles.machines().len(), "experiment is up");
        Ok(())
    }

    async fn provision_sites(
        &self,
        spec: &ExperimentSpec,
        store: &StateStore,
        state: &mut State,
        force: bool,
    ) -> Result<(), LifecycleError> {
        for (index, site) in spec.sites.iter().enumerate() {
            let label = site.label(index);
            if state.site(index).is_some() {
                debug!(site = %label, "site already provisioned; skipping");
                continue;
            }
            let provisioner = self.provisioners.get(&site.kind)?;
            let request = ProvisionRequest {
                index,
                site,
                label: label.clone(),
                state_dir: site_state_dir(store.output_dir(), index, &site.kind),
                force,
            };
            info!(site = %label, kind = %site.kind, "provisioning site");
            let provisioned =
                provisioner
                    .provision(&request)
                    .await
                    .map_err(|source| LifecycleError::Provisioning {
                        site: label.clone(),
                        source: Box::new(source),
                    })?;
            info!(site = %label, machines = provisioned.machines.len(), "site provisioned");
            state.upsert_site(SiteRecord {
                index,
                kind: site.kind.clone(),
                label,
                machines: provisioned.machines,
                agent_keys: provisioned.agent_keys,
                state_dir: provisioned.state_dir,
                backend: provisioned.backend,
            });
            store.save(state)?;
        }
        Ok(())
    }

    async fn distribute_host_map(
        &self,
        roles: &RoleMap,
        store: &StateStore,
        state: &mut State,
    ) -> Result<HostMap, LifecycleError> {
        let host_map = HostMap::generate(roles)?;
        let rendered = host_map.render();
        if state.host_map.as_deref() == Some(rendered.as_str()) {
            debug!("host map unchanged; not redistributing");
            return Ok(host_map);
        }
        if state.host_map.is_some() {
            info!("machine set changed; plugins will be installed again");
            state.installed = InstalledKinds::default();
        }

        let path = store.output_dir().join(HOSTS_FILE_NAME);
        files::write(&path, &rendered)?;
        let machines: Vec<&Machine> = roles.machines().iter().collect();
        host_map
            .distribute(
                self.remote.as_ref(),
                &machines,
                self.options.max_workers,
                self.command_timeout(),
            )
            .await?;
        state.host_map = Some(rendered);
        state
            .environment
            .apply(EnvironmentPatch::new().with(HOSTS_FILE_KEY, path.as_str()));
        state.advance(LifecycleState::Provisioned);
        store.save(state)?;
        Ok(host_map)
    }

    async fn bootstrap_machines(
        &self,
        roles: &RoleMap,
        store: &StateStore,
        state: &mut State,
    ) -> Result<(), LifecycleError> {
        if state.installed.commons {
            debug!("machines already bootstrapped; skipping");
            return Ok(());
        }
        let machines: Vec<&Machine> = roles.machines().iter().collect();
        info!(machines = machines.len(), "bootstrapping machines");
        bootstrap(
            self.remote.as_ref(),
            &machines,
            self.options.max_workers,
            self.options.retry,
        )
        .await
        .map_err(|err| LifecycleError::Bootstrap(Box::new(err)))?;
        state.installed.commons = true;
        store.save(state)?;
        Ok(())
    }

    async fn install(
        &self,
        stage: &InstallStage<'_>,
        spec: &ExperimentSpec,
        roles: &RoleMap,
        host_map: &HostMap,
        store: &StateStore,
        state: &mut State,
    ) -> Result<(), LifecycleError> {
        let category = stage.category;
        for plugin in stage.plugins {
            if (stage.installed)(&mut state.installed).contains(&plugin.kind) {
                debug!(%category, kind = %plugin.kind, "already installed; skipping");
                continue;
            }
            let failed = |source: PluginError| LifecycleError::Install {
                category,
                kind: plugin.kind.clone(),
                source: Box::new(source),
            };
            let problems = plugin.runner.check(roles);
            if !problems.is_empty() {
                return Err(failed(PluginError::Failed {
                    message: problems.join("; "),
                }));
            }

            info!(%category, kind = %plugin.kind, "installing");
            let patch = {
                let ctx = InstallContext {
                    roles,
                    environment: &state.environment,
                    remote: self.remote.as_ref(),
                    host_map,
                    options: &self.options,
                    working_dir: &spec.working_dir,
                };
                plugin.runner.install(&ctx).await
            }
            .map_err(failed)?;
            state.environment.apply(patch);
            (stage.installed)(&mut state.installed).insert(plugin.kind.clone());
            store.save(state)?;
            info!(%category, kind = %plugin.kind, "installed");
        }
        state.advance(stage.completes);
        store.save(state)?;
        Ok(())
    }

    /// Runs every experiment entry in document order, `count` times each.
    ///
    /// Iterations completed by an earlier run are skipped unless
    /// `options.force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotProvisioned`] before `up`, or the first
    /// failing iteration unless `options.keep_going` is set, in which case
    /// failures are listed in the summary instead.
    pub async fn run(
        &self,
        checked: &CheckedExperiment,
        store: &StateStore,
        options: RunOptions,
    ) -> Result<RunSummary, LifecycleError> {
        let mut state = store.load()?;
        if !state.stage.is_at_least(LifecycleState::Provisioned) {
            return Err(LifecycleError::NotProvisioned {
                output_dir: store.output_dir().to_path_buf(),
            });
        }
        let result = self
            .run_experiments(checked, store, &mut state, options)
            .await;
        settle(store, &mut state, result)
    }

    async fn run_experiments(
        &self,
        checked: &CheckedExperiment,
        store: &StateStore,
        state: &mut State,
        options: RunOptions,
    ) -> Result<RunSummary, LifecycleError> {
        let spec = checked.spec();
        let roles = RoleMap::resolve(&state.machines());
        let remote_dir = state
            .remote_working_dir
            .clone()
            .unwrap_or_else(|| remote_working_dir(&self.options.remote_root, &spec.name));
        if options.force || !state.working_dir_copied {
            self.copy_working_dir(&roles, &spec.working_dir, &remote_dir)
                .await?;
            state.working_dir_copied = true;
        }
        state.advance(LifecycleState::Running);
        store.save(state)?;

        let scope = RunScope {
            spec,
            store,
            roles: &roles,
            remote_dir: &remote_dir,
            force: options.force,
        };
        let mut summary = RunSummary::default();
        let entries = spec.experiments.iter().zip(&checked.plugins().experiments);
        for (index, (entry, plugin)) in entries.enumerate() {
            match self
                .run_entry(&scope, state, index, (entry, plugin), &mut summary)
                .await
            {
                Ok(()) => {}
                Err(err) if options.keep_going && !matches!(err, LifecycleError::State(_)) => {
                    warn!(experiment = %entry.name, error = %err, "experiment failed; continuing");
                    state.record_failure(err.failed_stage(), err.to_string());
                    store.save(state)?;
                    summary.failures.push((entry.name.clone(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        if summary.is_success() {
            state.advance(LifecycleState::Collected);
            store.save(state)?;
        }
        Ok(summary)
    }

    async fn run_entry(
        &self,
        scope: &RunScope<'_>,
        state: &mut State,
        index: usize,
        (entry, plugin): (&ExperimentEntry, &ResolvedPlugin<dyn ExperimentRunner>),
        summary: &mut RunSummary,
    ) -> Result<(), LifecycleError> {
        if scope.force {
            state.experiment_mut(index, &entry.name).completed.clear();
        }
        let variables = entry.variables_over(&scope.spec.variables);
        for iteration in 1..=entry.count {
            let record = state.experiment_mut(index, &entry.name);
            if record.completed.contains(&iteration) {
                debug!(experiment = %entry.name, iteration, "iteration already completed; skipping");
                summary.skipped.push((entry.name.clone(), iteration));
                continue;
            }
            let result_dir = scope
                .store
                .output_dir()
                .join(RESULTS_DIR_NAME)
                .join(&entry.name)
                .join(iteration.to_string());
            info!(experiment = %entry.name, iteration, count = entry.count, "running experiment");
            let outcome = self
                .run_iteration(&Iteration {
                    index,
                    iteration,
                    entry,
                    plugin,
                    roles: scope.roles,
                    environment: &state.environment,
                    variables: &variables,
                    working_dir: &scope.spec.working_dir,
                    remote_dir: scope.remote_dir,
                    result_dir: &result_dir,
                })
                .await;
            let (patch, warnings) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    state.experiment_mut(index, &entry.name).failed = Some(err.to_string());
                    return Err(err);
                }
            };
            state.environment.apply(patch);
            let completed = state.experiment_mut(index, &entry.name);
            completed.completed.insert(iteration);
            completed.failed = None;
            if !warnings.is_empty() {
                completed
                    .warnings
                    .insert(iteration, warnings.iter().map(ToString::to_string).collect());
            }
            scope.store.save(state)?;
            summary.completed.push((entry.name.clone(), iteration));
            summary.warnings.extend(warnings);
        }
        Ok(())
    }

    async fn copy_working_dir(
        &self,
        roles: &RoleMap,
        working_dir: &Utf8Path,
        remote_dir: &str,
    ) -> Result<(), LifecycleError> {
        let machines: Vec<&Machine> = roles.machines().iter().collect();
        let contents = Utf8PathBuf::from(format!("{}/", working_dir.as_str().trim_end_matches('/')));
        let mkdir = format!("mkdir -p {}", quote(remote_dir));
        let remote = self.remote.as_ref();
        let timeout = self.command_timeout();
        let (source, prepare) = (contents.as_path(), mkdir.as_str());
        info!(machines = machines.len(), destination = remote_dir, "copying the working directory");
        for_each_machine(&machines, self.options.max_workers, |machine| async move {
            exec_checked(remote, machine, prepare, timeout).await?;
            remote.push(machine, source, remote_dir).await
        })
        .await
        .map_err(LifecycleError::working_dir)?;
        Ok(())
    }

    async fn run_iteration(
        &self,
        it: &Iteration<'_>,
    ) -> Result<(EnvironmentPatch, Vec<CollectionWarning>), LifecycleError> {
        let problems = it.plugin.runner.check(it.roles);
        if !problems.is_empty() {
            return Err(it.failed(
                ExecutionStep::Check,
                PluginError::Failed {
                    message: problems.join("; "),
                },
            ));
        }
        files::ensure_dir(it.result_dir)?;

        self.push_inputs(it)
            .await
            .map_err(|err| it.failed(ExecutionStep::Inputs, err))?;
        self.run_scripts(&it.entry.setup, it)
            .await
            .map_err(|err| it.failed(ExecutionStep::Setup, err))?;
        let patch = {
            let ctx = ExperimentContext {
                index: it.index,
                iteration: it.iteration,
                name: &it.entry.name,
                working_dir: it.working_dir,
                remote_working_dir: it.remote_dir,
                result_dir: it.result_dir,
                roles: it.roles,
                environment: it.environment,
                variables: it.variables,
                remote: self.remote.as_ref(),
                options: &self.options,
            };
            it.plugin.runner.run(&ctx).await
        }
        .map_err(|err| it.failed(ExecutionStep::Run, err))?;
        self.run_scripts(&it.entry.post_scripts, it)
            .await
            .map_err(|err| it.failed(ExecutionStep::PostScripts, err))?;

        let warnings = collect_outputs(
            self.remote.as_ref(),
            it.roles,
            &it.entry.outputs,
            Collection {
                remote_working_dir: it.remote_dir,
                result_dir: it.result_dir,
                max_workers: self.options.max_workers,
            },
        )
        .await;
        Ok((patch, warnings))
    }

    async fn push_inputs(&self, it: &Iteration<'_>) -> Result<(), PluginError> {
        let remote = self.remote.as_ref();
        let timeout = self.command_timeout();
        for input in &it.entry.inputs {
            let machines = it.roles.require_all(&input.roles)?;
            let local = it.working_dir.join(&input.src);
            let target = remote_path(it.remote_dir, &input.dst);
            let prepare = target
                .rsplit_once('/')
                .map(|(parent, _)| parent)
                .filter(|parent| !parent.is_empty())
                .map(|parent| format!("mkdir -p {}", quote(parent)));
            let (source, destination, mkdir) = (local.as_path(), target.as_str(), prepare.as_deref());
            for_each_machine(&machines, self.options.max_workers, |machine| async move {
                if let Some(command) = mkdir {
                    exec_checked(remote, machine, command, timeout).await?;
                }
                remote.push(machine, source, destination).await
            })
            .await?;
        }
        Ok(())
    }

    async fn run_scripts(&self, scripts: &[Script], it: &Iteration<'_>) -> Result<(), PluginError> {
        for script in scripts {
            let machines = it.roles.require_all(&script.roles)?;
            let command = script_command(script, it.remote_dir, it.variables);
            run_script(
                self.remote.as_ref(),
                &machines,
                &command,
                self.options.max_workers,
            )
            .await?;
        }
        Ok(())
    }

    /// Tears every recorded site down in reverse document order.
    ///
    /// Each site goes through credential release, resource destruction, and
    /// local state removal. A failing site keeps its record and does not
    /// stop the others. The state file is deleted once no site is left.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Teardown`] listing every failed step, or
    /// [`LifecycleError::State`] when the state cannot be read.
    pub async fn down(&self, store: &StateStore) -> Result<DownOutcome, LifecycleError> {
        if !files::exists(store.path())? {
            info!(output = %store.output_dir(), "nothing is provisioned");
            return Ok(DownOutcome::NothingProvisioned);
        }
        let mut state = store.load()?;
        let records: Vec<SiteRecord> = state.sites.iter().rev().cloned().collect();
        let mut failures = Vec::new();
        let mut removed = 0;
        for record in &records {
            if !self.teardown_site(record, &mut failures).await {
                continue;
            }
            state.remove_site(record.index);
            removed += 1;
            if let Err(err) = store.save(&state) {
                failures.push(teardown_failure(record, TeardownStep::SaveState, &err));
            }
        }

        if state.sites.is_empty() {
            store.discard()?;
            info!(sites = removed, "every site is torn down");
        }
        if failures.is_empty() {
            return Ok(DownOutcome::TornDown { sites: removed });
        }
        let err = LifecycleError::from(TeardownError { failures });
        if !state.sites.is_empty() {
            state.record_failure(LifecycleState::TornDown, err.to_string());
            if let Err(save) = store.save(&state) {
                warn!(error = %save, "failed to record the teardown failure in state");
            }
        }
        Err(err)
    }

    async fn teardown_site(
        &self,
        record: &SiteRecord,
        failures: &mut Vec<SiteTeardownFailure>,
    ) -> bool {
        let provisioner = match self.provisioners.get(&record.kind) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                failures.push(teardown_failure(record, TeardownStep::Lookup, &err));
                return false;
            }
        };
        info!(site = %record.label, kind = %record.kind, "tearing down site");
        if let Err(err) = provisioner.release_credentials(record).await {
            warn!(site = %record.label, error = %err, "failed to release credentials");
            failures.push(teardown_failure(record, TeardownStep::ReleaseCredentials, &err));
        }
        if let Err(err) = provisioner.teardown(record).await {
            failures.push(teardown_failure(record, TeardownStep::Destroy, &err));
            return false;
        }
        if let Err(err) = provisioner.remove_local_state(record).await {
            failures.push(teardown_failure(record, TeardownStep::RemoveLocalState, &err));
            return false;
        }
        info!(site = %record.label, "site torn down");
        true
    }
}

fn teardown_failure(
    record: &SiteRecord,
    step: TeardownStep,
    err: &dyn fmt::Display,
) -> SiteTeardownFailure {
    SiteTeardownFailure {
        site: record.label.clone(),
        step,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
