//! Persisted lifecycle state shared by `up`, `run`, and `down`.
//!
//! The state of one output directory lives in `kiso-state.json`. Every
//! provisioning round carries a generation identifier; [`StateStore::save`]
//! refuses to overwrite a file written by another generation, so a
//! destroyed round can never clobber a newer one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::inventory::Machine;

mod store;

pub use store::{STATE_FILE_NAME, StateError, StateStore};

/// Version of the state file layout.
pub const STATE_VERSION: u32 = 1;

/// Stages of the experiment lifecycle, in order.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    /// Nothing has been validated yet.
    #[default]
    Unchecked,
    /// The document and its plugins passed validation.
    Checked,
    /// Every site is provisioned and the host map distributed.
    Provisioned,
    /// Every software plugin is installed.
    SoftwareInstalled,
    /// Every deployment plugin is installed.
    Deployed,
    /// Experiments are executing.
    Running,
    /// Every experiment ran and its results were collected.
    Collected,
    /// Every site was destroyed.
    TornDown,
    /// A stage failed; never persisted as the current stage.
    Failed,
}

impl LifecycleState {
    /// Whether this stage is `stage` or a later one.
    ///
    /// `Failed` is never at least anything.
    #[must_use]
    pub fn is_at_least(self, stage: Self) -> bool {
        self != Self::Failed && self >= stage
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unchecked => "unchecked",
            Self::Checked => "checked",
            Self::Provisioned => "provisioned",
            Self::SoftwareInstalled => "software-installed",
            Self::Deployed => "deployed",
            Self::Running => "running",
            Self::Collected => "collected",
            Self::TornDown => "torn-down",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cross-stage key-value store owned by plugins.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, Value>);

impl Environment {
    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Merges `patch`, replacing existing keys.
    pub fn apply(&mut self, patch: EnvironmentPatch) {
        self.0.extend(patch.0);
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns `true` when there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Entries a stage returns for merging into the [`Environment`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentPatch(BTreeMap<String, Value>);

impl EnvironmentPatch {
    /// Creates an empty patch.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds an entry, consuming and returning the patch.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns `true` when the patch carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What one site produced and what tearing it down needs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SiteRecord {
    /// Position of the site in the document.
    pub index: usize,
    /// Provider key.
    pub kind: String,
    /// Site label.
    pub label: String,
    /// Machines the site yielded.
    pub machines: Vec<Machine>,
    /// Private keys registered with the local SSH agent.
    #[serde(default)]
    pub agent_keys: Vec<Utf8PathBuf>,
    /// Provider-owned local directory, removed during teardown.
    #[serde(default)]
    pub state_dir: Option<Utf8PathBuf>,
    /// Provider-specific teardown data.
    #[serde(default)]
    pub backend: Value,
}

/// Progress of one experiment entry.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExperimentRecord {
    /// Experiment name.
    pub name: String,
    /// Iterations that finished.
    #[serde(default)]
    pub completed: BTreeSet<u32>,
    /// Result-collection warnings, per iteration.
    #[serde(default)]
    pub warnings: BTreeMap<u32, Vec<String>>,
    /// Failure message of the last attempt, if it failed.
    #[serde(default)]
    pub failed: Option<String>,
}

/// The stage that failed last and why.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Stage that was being attempted.
    pub stage: String,
    /// Rendered error.
    pub message: String,
}

/// Kinds installed so far, per category.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstalledKinds {
    /// Whether every machine went through the common bootstrap.
    #[serde(default)]
    pub commons: bool,
    /// Software kinds.
    #[serde(default)]
    pub software: BTreeSet<String>,
    /// Deployment kinds.
    #[serde(default)]
    pub deployment: BTreeSet<String>,
}

/// State of one output directory.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct State {
    /// Layout version.
    pub version: u32,
    /// Provisioning round this state belongs to.
    pub generation: Uuid,
    /// Last completed stage.
    pub stage: LifecycleState,
    /// Name of the experiment document.
    #[serde(default)]
    pub experiment: Option<String>,
    /// Local working directory.
    #[serde(default)]
    pub working_dir: Option<Utf8PathBuf>,
    /// Remote working directory.
    #[serde(default)]
    pub remote_working_dir: Option<String>,
    /// Provisioned sites, ordered by index.
    #[serde(default)]
    pub sites: Vec<SiteRecord>,
    /// Plugin environment.
    #[serde(default)]
    pub environment: Environment,
    /// Installed plugin kinds.
    #[serde(default)]
    pub installed: InstalledKinds,
    /// Rendered host map last distributed.
    #[serde(default)]
    pub host_map: Option<String>,
    /// Whether this generation already copied the working directory.
    #[serde(default)]
    pub working_dir_copied: bool,
    /// Experiment progress keyed by document position.
    #[serde(default)]
    pub experiments: BTreeMap<usize, ExperimentRecord>,
    /// Last failure, cleared when a stage completes.
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Fresh state for a new generation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            generation: Uuid::new_v4(),
            stage: LifecycleState::Unchecked,
            experiment: None,
            working_dir: None,
            remote_working_dir: None,
            sites: Vec::new(),
            environment: Environment::default(),
            installed: InstalledKinds::default(),
            host_map: None,
            working_dir_copied: false,
            experiments: BTreeMap::new(),
            failure: None,
        }
    }

    /// Raises the stage to `stage`; never lowers it.
    pub fn advance(&mut self, stage: LifecycleState) {
        if stage != LifecycleState::Failed && stage > self.stage {
            self.stage = stage;
        }
        self.failure = None;
    }

    /// Records a failure without moving the stage.
    pub fn record_failure(&mut self, stage: LifecycleState, message: impl Into<String>) {
        self.failure = Some(FailureRecord {
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    /// Every machine of every site, in site order.
    #[must_use]
    pub fn machines(&self) -> Vec<Machine> {
        self.sites
            .iter()
            .flat_map(|site| site.machines.iter().cloned())
            .collect()
    }

    /// Record of the site at `index`.
    #[must_use]
    pub fn site(&self, index: usize) -> Option<&SiteRecord> {
        self.sites.iter().find(|site| site.index == index)
    }

    /// Inserts or replaces the record of a site, keeping index order.
    pub fn upsert_site(&mut self, record: SiteRecord) {
        self.sites.retain(|site| site.index != record.index);
        self.sites.push(record);
        self.sites.sort_by_key(|site| site.index);
    }

    /// Drops the record of the site at `index`.
    pub fn remove_site(&mut self, index: usize) {
        self.sites.retain(|site| site.index != index);
    }

    /// Progress record of the experiment at `index`, created on first use.
    pub fn experiment_mut(&mut self, index: usize, name: &str) -> &mut ExperimentRecord {
        let record = self.experiments.entry(index).or_default();
        if record.name != name {
            *record = ExperimentRecord {
                name: name.to_owned(),
                ..ExperimentRecord::default()
            };
        }
        record
    }
}

#[cfg(test)]
mod tests;
