//! Placeholder inventory derived from declared site resources.

use crate::experiment::SiteSpec;

use super::Machine;

/// Builds the machine set the declared sites would produce.
///
/// Used by `check` to validate role references without provisioning
/// anything. Identifiers are placeholders of the form
/// `planned-<site>-<request>-<n>`.
#[must_use]
pub fn plan(sites: &[SiteSpec]) -> Vec<Machine> {
    let mut machines = Vec::new();
    for (index, site) in sites.iter().enumerate() {
        let label = site.label(index);
        for (request_index, request) in site.resources.machines.iter().enumerate() {
            for n in 1..=request.number.max(1) {
                machines.push(
                    Machine::new(
                        format!("planned-{index}-{request_index}-{n}"),
                        &site.kind,
                        &label,
                    )
                    .with_roles(request.roles.iter().cloned()),
                );
            }
        }
    }
    machines
}
