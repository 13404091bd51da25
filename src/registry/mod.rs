//! Plugin contracts and the registry resolving document sections to runners.
//!
//! A plugin registers a kind, a JSON schema, a config type, and a
//! constructor for one of three categories. The registry is built once at
//! start-up; duplicate kinds fail the build.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::experiment::{ConfigError, ExperimentSpec};
use crate::files::FileError;
use crate::hostmap::HostMap;
use crate::inventory::{RoleMap, UnresolvedRoleError};
use crate::remote::{RemoteError, RemoteRunner};
use crate::schema::{self, SchemaViolation};
use crate::settings::LifecycleOptions;
use crate::state::{Environment, EnvironmentPatch};

/// Future returned by plugin operations.
pub type PluginFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PluginError>> + Send + 'a>>;

/// Errors raised by plugin runners.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PluginError {
    /// Raised when a remote command or transfer fails.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Raised when a mandatory role selects no machine.
    #[error(transparent)]
    UnresolvedRole(#[from] UnresolvedRoleError),
    /// Raised when a local file cannot be accessed.
    #[error(transparent)]
    Files(#[from] FileError),
    /// Raised for plugin-specific failures.
    #[error("{message}")]
    Failed {
        /// Failure description.
        message: String,
    },
}

/// Plugin category; kinds are unique within a category.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PluginCategory {
    /// Software installed on machines.
    Software,
    /// Cluster middleware deployed across machines.
    Deployment,
    /// Experiment runners.
    Experiment,
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Software => "software",
            Self::Deployment => "deployment",
            Self::Experiment => "experiment",
        })
    }
}

/// Raised when a document names a kind nobody registered.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown {category} kind `{kind}`; available: {}", .available.join(", "))]
pub struct UnknownKindError {
    /// Category searched, for example `software` or `site`.
    pub category: String,
    /// Kind that was requested.
    pub kind: String,
    /// Kinds that are registered, sorted.
    pub available: Vec<String>,
}

/// Raised when the registry cannot be built.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when two plugins register the same kind in one category.
    #[error("{category} kind `{kind}` is registered twice")]
    DuplicateKind {
        /// Category of the clash.
        category: PluginCategory,
        /// Kind registered twice.
        kind: String,
    },
}

/// Raised when document sections cannot be matched to plugins.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// Raised for a kind nobody registered.
    #[error(transparent)]
    UnknownKind(#[from] UnknownKindError),
    /// Raised when sections violate their plugin schema.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What an installer sees while installing.
pub struct InstallContext<'a> {
    /// Resolved roles.
    pub roles: &'a RoleMap,
    /// Environment accumulated so far.
    pub environment: &'a Environment,
    /// Access to machines.
    pub remote: &'a dyn RemoteRunner,
    /// Host map distributed to every machine.
    pub host_map: &'a HostMap,
    /// Concurrency, timeout, and retry limits.
    pub options: &'a LifecycleOptions,
    /// Local directory holding the experiment document.
    pub working_dir: &'a Utf8Path,
}

/// What an experiment runner sees during one iteration.
pub struct ExperimentContext<'a> {
    /// Position of the entry in the document.
    pub index: usize,
    /// Iteration being run, starting at 1.
    pub iteration: u32,
    /// Experiment name.
    pub name: &'a str,
    /// Local directory holding the experiment document.
    pub working_dir: &'a Utf8Path,
    /// Copy of the working directory on every machine.
    pub remote_working_dir: &'a str,
    /// Local directory receiving this iteration's results.
    pub result_dir: &'a Utf8Path,
    /// Resolved roles.
    pub roles: &'a RoleMap,
    /// Environment accumulated so far.
    pub environment: &'a Environment,
    /// Variables exported to scripts.
    pub variables: &'a BTreeMap<String, Value>,
    /// Access to machines.
    pub remote: &'a dyn RemoteRunner,
    /// Concurrency, timeout, and retry limits.
    pub options: &'a LifecycleOptions,
}

fn undefined_role_problems(declared: &[String], roles: &RoleMap) -> Vec<String> {
    roles
        .undefined(declared)
        .into_iter()
        .map(|role| format!("references undefined role `{role}`"))
        .collect()
}

/// Runner for a software or deployment section.
pub trait Installer: Send + Sync {
    /// Roles the section targets.
    fn roles(&self) -> Vec<String>;

    /// Problems with the section against `roles`; empty when consistent.
    fn check(&self, roles: &RoleMap) -> Vec<String> {
        undefined_role_problems(&self.roles(), roles)
    }

    /// Installs on the targeted machines and returns environment entries.
    fn install<'a>(&'a self, ctx: &'a InstallContext<'a>) -> PluginFuture<'a, EnvironmentPatch>;
}

/// Runner for an experiment entry.
pub trait ExperimentRunner: Send + Sync {
    /// Roles the kind-specific keys target.
    fn roles(&self) -> Vec<String>;

    /// Problems with the entry against `roles`; empty when consistent.
    fn check(&self, roles: &RoleMap) -> Vec<String> {
        undefined_role_problems(&self.roles(), roles)
    }

    /// Runs one iteration and returns environment entries.
    fn run<'a>(&'a self, ctx: &'a ExperimentContext<'a>) -> PluginFuture<'a, EnvironmentPatch>;
}

type Constructor<T> = Box<dyn Fn(Value) -> Result<Box<T>, String> + Send + Sync>;

/// Kind, schema, and constructor of one plugin.
pub struct PluginRegistration<T: ?Sized> {
    kind: String,
    schema: Value,
    construct: Constructor<T>,
}

impl<T: ?Sized + 'static> PluginRegistration<T> {
    /// Registers `kind`, whose sections satisfy `schema` and decode into
    /// `C` before `construct` builds the runner.
    #[must_use]
    pub fn new<C, F>(kind: impl Into<String>, schema: Value, construct: F) -> Self
    where
        C: DeserializeOwned + 'static,
        F: Fn(C) -> Box<T> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            schema,
            construct: Box::new(move |value| {
                serde_json::from_value::<C>(value)
                    .map(&construct)
                    .map_err(|err| err.to_string())
            }),
        }
    }

    /// Registered kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Schema sections of this kind satisfy.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    fn instantiate(&self, config: Value, context: &str) -> Result<Box<T>, ConfigError> {
        (self.construct)(config).map_err(|message| ConfigError::Decode {
            context: context.to_owned(),
            message,
        })
    }
}

impl<T: ?Sized> fmt::Debug for PluginRegistration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A runner bound to the document section it was built from.
pub struct ResolvedPlugin<T: ?Sized> {
    /// Plugin kind.
    pub kind: String,
    /// Section name used in messages, for example `software.docker`.
    pub context: String,
    /// The runner.
    pub runner: Box<T>,
}

impl<T: ?Sized> fmt::Debug for ResolvedPlugin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPlugin")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Runners for every plugin section of a document, in document order.
#[derive(Debug, Default)]
pub struct ResolvedPlugins {
    /// Software installers.
    pub software: Vec<ResolvedPlugin<dyn Installer>>,
    /// Deployment installers.
    pub deployment: Vec<ResolvedPlugin<dyn Installer>>,
    /// Experiment runners, one per entry.
    pub experiments: Vec<ResolvedPlugin<dyn ExperimentRunner>>,
}

type Table<T> = BTreeMap<String, PluginRegistration<T>>;

/// Plugin lookup keyed by category and kind.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    software: Table<dyn Installer>,
    deployment: Table<dyn Installer>,
    experiment: Table<dyn ExperimentRunner>,
}

/// Collects registrations before [`PluginRegistryBuilder::build`] checks
/// them.
#[derive(Debug, Default)]
pub struct PluginRegistryBuilder {
    software: Vec<PluginRegistration<dyn Installer>>,
    deployment: Vec<PluginRegistration<dyn Installer>>,
    experiment: Vec<PluginRegistration<dyn ExperimentRunner>>,
}

fn table<T: ?Sized + 'static>(
    category: PluginCategory,
    registrations: Vec<PluginRegistration<T>>,
) -> Result<Table<T>, RegistryError> {
    let mut entries = Table::new();
    for registration in registrations {
        if entries.contains_key(registration.kind()) {
            return Err(RegistryError::DuplicateKind {
                category,
                kind: registration.kind,
            });
        }
        entries.insert(registration.kind.clone(), registration);
    }
    Ok(entries)
}

impl PluginRegistryBuilder {
    /// Adds a software plugin.
    #[must_use]
    pub fn software(mut self, registration: PluginRegistration<dyn Installer>) -> Self {
        self.software.push(registration);
        self
    }

    /// Adds a deployment plugin.
    #[must_use]
    pub fn deployment(mut self, registration: PluginRegistration<dyn Installer>) -> Self {
        self.deployment.push(registration);
        self
    }

    /// Adds an experiment plugin.
    #[must_use]
    pub fn experiment(mut self, registration: PluginRegistration<dyn ExperimentRunner>) -> Self {
        self.experiment.push(registration);
        self
    }

    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateKind`] when a kind is registered
    /// twice within a category.
    pub fn build(self) -> Result<PluginRegistry, RegistryError> {
        Ok(PluginRegistry {
            software: table(PluginCategory::Software, self.software)?,
            deployment: table(PluginCategory::Deployment, self.deployment)?,
            experiment: table(PluginCategory::Experiment, self.experiment)?,
        })
    }
}

fn lookup<'r, T: ?Sized>(
    table: &'r Table<T>,
    category: PluginCategory,
    kind: &str,
) -> Result<&'r PluginRegistration<T>, UnknownKindError> {
    table.get(kind).ok_or_else(|| UnknownKindError {
        category: category.to_string(),
        kind: kind.to_owned(),
        available: table.keys().cloned().collect(),
    })
}

struct Pending<'r, T: ?Sized> {
    registration: &'r PluginRegistration<T>,
    context: String,
    config: Value,
}

impl PluginRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Registry holding the built-in plugins.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if two built-ins share a kind.
    pub fn builtin() -> Result<Self, RegistryError> {
        crate::plugins::register(Self::builder()).build()
    }

    /// Kinds registered in `category`, sorted.
    #[must_use]
    pub fn kinds(&self, category: PluginCategory) -> Vec<&str> {
        match category {
            PluginCategory::Software => self.software.keys().map(String::as_str).collect(),
            PluginCategory::Deployment => self.deployment.keys().map(String::as_str).collect(),
            PluginCategory::Experiment => self.experiment.keys().map(String::as_str).collect(),
        }
    }

    /// Builds a runner for every plugin section of `spec`.
    ///
    /// Unknown kinds fail first. Schema violations are then collected across
    /// all sections before any section is decoded.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownKind`] for the first unknown kind, or
    /// [`ResolveError::Config`] with every schema violation.
    pub fn resolve(&self, spec: &ExperimentSpec) -> Result<ResolvedPlugins, ResolveError> {
        let software = spec
            .software
            .iter()
            .map(|section| {
                Ok(Pending {
                    registration: lookup(&self.software, PluginCategory::Software, &section.kind)?,
                    context: format!("software.{}", section.kind),
                    config: section.config.clone(),
                })
            })
            .collect::<Result<Vec<_>, UnknownKindError>>()?;
        let deployment = spec
            .deployment
            .iter()
            .map(|section| {
                Ok(Pending {
                    registration: lookup(
                        &self.deployment,
                        PluginCategory::Deployment,
                        &section.kind,
                    )?,
                    context: format!("deployment.{}", section.kind),
                    config: section.config.clone(),
                })
            })
            .collect::<Result<Vec<_>, UnknownKindError>>()?;
        let experiments = spec
            .experiments
            .iter()
            .map(|entry| {
                Ok(Pending {
                    registration: lookup(&self.experiment, PluginCategory::Experiment, &entry.kind)?,
                    context: format!("experiments.{}", entry.name),
                    config: entry.plugin_config(),
                })
            })
            .collect::<Result<Vec<_>, UnknownKindError>>()?;

        let mut violations: Vec<SchemaViolation> = Vec::new();
        collect_violations(&software, &mut violations);
        collect_violations(&deployment, &mut violations);
        collect_violations(&experiments, &mut violations);
        if !violations.is_empty() {
            return Err(ConfigError::Schema { violations }.into());
        }

        Ok(ResolvedPlugins {
            software: instantiate(software)?,
            deployment: instantiate(deployment)?,
            experiments: instantiate(experiments)?,
        })
    }
}

fn collect_violations<T: ?Sized + 'static>(pending: &[Pending<'_, T>], violations: &mut Vec<SchemaViolation>) {
    for section in pending {
        if let Err(found) =
            schema::validate(section.registration.schema(), &section.config, &section.context)
        {
            violations.extend(found);
        }
    }
}

fn instantiate<T: ?Sized + 'static>(pending: Vec<Pending<'_, T>>) -> Result<Vec<ResolvedPlugin<T>>, ConfigError> {
    pending
        .into_iter()
        .map(|section| {
            let runner = section
                .registration
                .instantiate(section.config, &section.context)?;
            Ok(ResolvedPlugin {
                kind: section.registration.kind.clone(),
                context: section.context,
                runner,
            })
        })
        .collect()
}
