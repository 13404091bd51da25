//! Core library for the Kiso experiment lifecycle tool.
//!
//! An experiment document names the sites to provision, the software and
//! deployments to install, and the experiments to run. The
//! [`orchestrator`] drives those stages (`check`, `up`, `run`, `down`)
//! through the [`provision::Provisioner`] and [`remote::RemoteRunner`]
//! capabilities, persisting progress in a per-output-directory
//! [`state::StateStore`] so every command can resume where the last one
//! stopped.

pub mod bootstrap;
pub mod collect;
pub mod experiment;
pub mod files;
pub mod hostmap;
pub mod inventory;
pub mod logging;
pub mod orchestrator;
pub mod plugins;
pub mod provision;
pub mod registry;
pub mod remote;
pub mod schema;
pub mod settings;
pub mod state;
pub mod test_support;
pub mod transport;

pub use experiment::{ConfigError, ExperimentSpec};
pub use inventory::{Machine, RoleMap};
pub use orchestrator::{
    CheckedExperiment, DownOutcome, LifecycleError, Orchestrator, RunOptions, RunSummary,
    UpOutcome, check,
};
pub use registry::{PluginCategory, PluginRegistry};
pub use settings::{KisoSettings, LifecycleOptions};
pub use state::{LifecycleState, StateStore};
