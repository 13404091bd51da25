//! `check`: every validation that needs no machine.

use tracing::info;

use crate::experiment::{ConfigError, ExperimentSpec};
use crate::inventory::{self, RoleMap};
use crate::provision::ProvisionerRegistry;
use crate::registry::{PluginRegistry, ResolveError, ResolvedPlugins};

use super::LifecycleError;

/// A document that passed every check, with a runner for each of its
/// plugin sections.
#[derive(Debug)]
pub struct CheckedExperiment {
    spec: ExperimentSpec,
    plugins: ResolvedPlugins,
}

impl CheckedExperiment {
    /// The validated document.
    #[must_use]
    pub const fn spec(&self) -> &ExperimentSpec {
        &self.spec
    }

    /// Runners for the document's plugin sections, in document order.
    #[must_use]
    pub const fn plugins(&self) -> &ResolvedPlugins {
        &self.plugins
    }
}

/// Validates `spec` without provisioning anything or contacting a machine.
///
/// Sites are validated against their provider's schema and plugin sections
/// against their plugin's schema; every violation is reported at once. The
/// document and every plugin are then checked against the inventory the
/// sites would produce.
///
/// # Errors
///
/// Returns [`LifecycleError::UnknownKind`] for an unregistered kind,
/// [`LifecycleError::Config`] with every schema violation, or with every
/// consistency problem.
pub fn check(
    spec: ExperimentSpec,
    registry: &PluginRegistry,
    provisioners: &ProvisionerRegistry,
) -> Result<CheckedExperiment, LifecycleError> {
    let mut violations = provisioners.violations(&spec.sites)?;
    let resolved = match registry.resolve(&spec) {
        Ok(plugins) => Some(plugins),
        Err(ResolveError::Config(ConfigError::Schema { violations: found })) => {
            violations.extend(found);
            None
        }
        Err(other) => return Err(other.into()),
    };
    let Some(plugins) = resolved.filter(|_| violations.is_empty()) else {
        return Err(ConfigError::Schema { violations }.into());
    };

    let roles = RoleMap::resolve(&inventory::plan(&spec.sites));
    let mut problems = spec.semantic_problems(&roles);
    for plugin in plugins.software.iter().chain(&plugins.deployment) {
        problems.extend(
            plugin
                .runner
                .check(&roles)
                .into_iter()
                .map(|problem| format!("{}: {problem}", plugin.context)),
        );
    }
    for plugin in &plugins.experiments {
        problems.extend(
            plugin
                .runner
                .check(&roles)
                .into_iter()
                .map(|problem| format!("{}: {problem}", plugin.context)),
        );
    }
    if !problems.is_empty() {
        return Err(ConfigError::Invalid { problems }.into());
    }

    info!(
        experiment = %spec.name,
        sites = spec.sites.len(),
        experiments = spec.experiments.len(),
        "experiment document passed checks"
    );
    Ok(CheckedExperiment { spec, plugins })
}
