//! Consistency checks for documents that already satisfy the root schema.

use std::collections::BTreeSet;

use crate::files;
use crate::inventory::{RESERVED_ROLE_PREFIX, RoleMap};

use super::ExperimentSpec;

impl ExperimentSpec {
    /// Lists every consistency problem of the document against `roles`.
    ///
    /// Roles may not use the reserved prefix, experiment sections may only
    /// reference roles that `roles` resolves, experiment names must be
    /// unique, and input files must exist. Plugin sections are checked by
    /// their plugins.
    #[must_use]
    pub fn semantic_problems(&self, roles: &RoleMap) -> Vec<String> {
        let mut problems = self.reserved_role_problems();
        problems.extend(self.duplicate_name_problems());
        problems.extend(self.undefined_role_problems(roles));
        problems.extend(self.missing_input_problems());
        problems
    }

    fn reserved_role_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (index, site) in self.sites.iter().enumerate() {
            for request in &site.resources.machines {
                problems.extend(
                    request
                        .roles
                        .iter()
                        .filter(|role| role.starts_with(RESERVED_ROLE_PREFIX))
                        .map(|role| {
                            format!(
                                "site {}: role `{role}` uses the reserved `{RESERVED_ROLE_PREFIX}` prefix",
                                site.label(index)
                            )
                        }),
                );
            }
        }
        problems
    }

    fn duplicate_name_problems(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut reported = BTreeSet::new();
        self.experiments
            .iter()
            .filter(|entry| !seen.insert(entry.name.as_str()))
            .filter(|entry| reported.insert(entry.name.as_str()))
            .map(|entry| format!("experiment name `{}` is used more than once", entry.name))
            .collect()
    }

    fn undefined_role_problems(&self, roles: &RoleMap) -> Vec<String> {
        let mut problems = Vec::new();
        for entry in &self.experiments {
            for (section, role) in entry.referenced_roles() {
                if !roles.contains(role) {
                    problems.push(format!(
                        "experiment {}: {section} references undefined role `{role}`",
                        entry.name
                    ));
                }
            }
        }
        problems
    }

    fn missing_input_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for entry in &self.experiments {
            for input in &entry.inputs {
                let path = self.working_dir.join(&input.src);
                match files::exists(&path) {
                    Ok(true) => {}
                    Ok(false) => problems.push(format!(
                        "experiment {}: input file {path} does not exist",
                        entry.name
                    )),
                    Err(err) => problems.push(format!("experiment {}: {err}", entry.name)),
                }
            }
        }
        problems
    }
}
