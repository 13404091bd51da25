//! Errors surfaced by the lifecycle stages.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::experiment::ConfigError;
use crate::files::FileError;
use crate::hostmap::HostMapError;
use crate::inventory::UnresolvedRoleError;
use crate::provision::ProvisionError;
use crate::registry::{PluginCategory, PluginError, RegistryError, ResolveError, UnknownKindError};
use crate::remote::RemoteError;
use crate::state::{LifecycleState, StateError};
use crate::transport::TransportError;

/// Step of one experiment iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionStep {
    /// The plugin's consistency check.
    Check,
    /// Pushing inputs.
    Inputs,
    /// Setup scripts.
    Setup,
    /// The plugin run itself.
    Run,
    /// Post-scripts.
    PostScripts,
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Check => "check",
            Self::Inputs => "input transfer",
            Self::Setup => "setup",
            Self::Run => "run",
            Self::PostScripts => "post-scripts",
        })
    }
}

/// Step of the per-site teardown protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownStep {
    /// Finding the provisioner of the site.
    Lookup,
    /// Removing keys from the local SSH agent.
    ReleaseCredentials,
    /// Destroying provider resources.
    Destroy,
    /// Removing provider files.
    RemoveLocalState,
    /// Persisting the shrunken state.
    SaveState,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lookup => "provider lookup",
            Self::ReleaseCredentials => "releasing credentials",
            Self::Destroy => "destroying resources",
            Self::RemoveLocalState => "removing local state",
            Self::SaveState => "saving state",
        })
    }
}

/// A teardown step that failed for one site.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SiteTeardownFailure {
    /// Site label.
    pub site: String,
    /// Step that failed.
    pub step: TeardownStep,
    /// Rendered cause.
    pub message: String,
}

impl fmt::Display for SiteTeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site {}: {} failed: {}", self.site, self.step, self.message)
    }
}

/// Every teardown failure of one `down`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("teardown incomplete:\n{}", render_failures(.failures))]
pub struct TeardownError {
    /// Failures in the order they happened.
    pub failures: Vec<SiteTeardownFailure>,
}

fn render_failures(failures: &[SiteTeardownFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  - {failure}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors surfaced by `check`, `up`, `run`, and `down`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// The document is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A section names an unregistered kind.
    #[error(transparent)]
    UnknownKind(#[from] UnknownKindError),
    /// The plugin registry could not be built.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A mandatory role selects no machine.
    #[error(transparent)]
    UnresolvedRole(#[from] UnresolvedRoleError),
    /// A site could not be provisioned.
    #[error("provisioning site {site} failed: {source}")]
    Provisioning {
        /// Site label.
        site: String,
        /// Provider failure.
        #[source]
        source: Box<ProvisionError>,
    },
    /// A machine could not be bootstrapped.
    #[error("bootstrapping machines failed: {0}")]
    Bootstrap(#[source] Box<RemoteError>),
    /// A software or deployment plugin failed.
    #[error("installing {category} `{kind}` failed: {source}")]
    Install {
        /// Category of the plugin.
        category: PluginCategory,
        /// Plugin kind.
        kind: String,
        /// Plugin failure.
        #[source]
        source: Box<PluginError>,
    },
    /// An experiment iteration failed.
    #[error("experiment {experiment} iteration {iteration} failed during {step}: {source}")]
    Execution {
        /// Experiment name.
        experiment: String,
        /// Iteration, starting at 1.
        iteration: u32,
        /// Step that failed.
        step: ExecutionStep,
        /// Underlying failure.
        #[source]
        source: Box<PluginError>,
    },
    /// The working directory could not be copied to a machine.
    #[error("copying the working directory failed: {0}")]
    WorkingDir(#[source] Box<RemoteError>),
    /// Some sites could not be torn down.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    /// A machine is unreachable.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The host map could not be built or distributed.
    #[error(transparent)]
    HostMap(Box<HostMapError>),
    /// The state file could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),
    /// A local file could not be written.
    #[error(transparent)]
    Files(#[from] FileError),
    /// `run` was invoked before `up`.
    #[error("nothing is provisioned in {output_dir}; run `kiso up` first")]
    NotProvisioned {
        /// Output directory that holds no provisioned state.
        output_dir: Utf8PathBuf,
    },
}

impl From<HostMapError> for LifecycleError {
    fn from(err: HostMapError) -> Self {
        Self::HostMap(Box::new(err))
    }
}

impl From<ResolveError> for LifecycleError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownKind(unknown) => Self::UnknownKind(unknown),
            ResolveError::Config(config) => Self::Config(config),
        }
    }
}

impl LifecycleError {
    pub(crate) fn working_dir(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(transport) => Self::Transport(transport),
            other => Self::WorkingDir(Box::new(other)),
        }
    }

    /// Stage that was being attempted when the error occurred.
    #[must_use]
    pub const fn failed_stage(&self) -> LifecycleState {
        match self {
            Self::Config(_)
            | Self::UnknownKind(_)
            | Self::Registry(_)
            | Self::UnresolvedRole(_)
            | Self::State(_) => LifecycleState::Checked,
            Self::Provisioning { .. } | Self::HostMap(_) | Self::Transport(_) | Self::Files(_) => {
                LifecycleState::Provisioned
            }
            Self::Bootstrap(_)
            | Self::Install {
                category: PluginCategory::Software,
                ..
            } => LifecycleState::SoftwareInstalled,
            Self::Install {
                category: PluginCategory::Deployment,
                ..
            } => LifecycleState::Deployed,
            Self::Install { .. }
            | Self::Execution { .. }
            | Self::WorkingDir(_)
            | Self::NotProvisioned { .. } => LifecycleState::Running,
            Self::Teardown(_) => LifecycleState::TornDown,
        }
    }
}
