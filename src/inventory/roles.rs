//! Role resolution over the provisioned machine set.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::Machine;

/// Prefix reserved for labels synthesized by the resolver.
pub const RESERVED_ROLE_PREFIX: &str = "kiso.";

/// Raised when a mandatory role selects no machines.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("role `{role}` does not resolve to any provisioned machine")]
pub struct UnresolvedRoleError {
    /// Role that resolved to nothing.
    pub role: String,
}

/// Mapping from role label to the machines holding it.
///
/// Machines are ordered by identifier and then by their position in the
/// input, so every projection of the map is deterministic. Besides the roles
/// a provisioner assigns, each machine also carries:
///
/// - `<provider>`: every machine created by that provider;
/// - `<provider>.<site>`: every machine of one site;
/// - `kiso.<role>.<n>`: a unique, 1-based label per machine of each role.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RoleMap {
    machines: Vec<Machine>,
    labels: BTreeMap<String, Vec<usize>>,
}

/// Site-grouping label synthesized for every machine.
#[must_use]
pub fn site_label(provider: &str, site: &str) -> String {
    format!("{provider}.{site}")
}

impl RoleMap {
    /// Builds the map from the full machine set.
    ///
    /// Records sharing an identifier are merged: their roles are unioned
    /// and unseen addresses appended.
    #[must_use]
    pub fn resolve(machines: &[Machine]) -> Self {
        let mut unique: Vec<(usize, Machine)> = Vec::new();
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, machine) in machines.iter().enumerate() {
            if let Some(&position) = positions.get(machine.id.as_str()) {
                if let Some((_, existing)) = unique.get_mut(position) {
                    existing.merge(machine);
                }
                continue;
            }
            positions.insert(machine.id.as_str(), unique.len());
            unique.push((index, machine.clone()));
        }
        unique.sort_by(|(left_index, left), (right_index, right)| {
            left.id
                .cmp(&right.id)
                .then_with(|| left_index.cmp(right_index))
        });

        let mut ordered: Vec<Machine> = unique.into_iter().map(|(_, machine)| machine).collect();
        let mut counters: BTreeMap<String, usize> = BTreeMap::new();
        for machine in &mut ordered {
            let declared: Vec<String> = machine
                .roles
                .iter()
                .filter(|role| !role.starts_with(RESERVED_ROLE_PREFIX))
                .cloned()
                .collect();
            for role in declared {
                let counter = counters.entry(role.clone()).or_insert(0);
                *counter += 1;
                machine
                    .roles
                    .insert(format!("{RESERVED_ROLE_PREFIX}{role}.{counter}"));
            }
            machine.roles.insert(machine.provider.clone());
            machine
                .roles
                .insert(site_label(&machine.provider, &machine.site));
        }

        let mut labels: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, machine) in ordered.iter().enumerate() {
            for role in &machine.roles {
                labels.entry(role.clone()).or_default().push(index);
            }
        }

        Self {
            machines: ordered,
            labels,
        }
    }

    /// All machines in resolution order.
    #[must_use]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Looks up a machine by identifier.
    #[must_use]
    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|machine| machine.id == id)
    }

    /// Returns `true` when no machines are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Returns `true` when `role` selects at least one machine.
    #[must_use]
    pub fn contains(&self, role: &str) -> bool {
        self.labels.contains_key(role)
    }

    /// Iterates over every known label in sorted order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }

    /// Machines holding `role`; empty when the role is unknown.
    #[must_use]
    pub fn get(&self, role: &str) -> Vec<&Machine> {
        self.labels.get(role).map_or_else(Vec::new, |indices| {
            indices
                .iter()
                .filter_map(|index| self.machines.get(*index))
                .collect()
        })
    }

    /// Union of the machines holding any of `roles`, in resolution order.
    ///
    /// Unknown roles contribute nothing; use [`RoleMap::require_all`] where a
    /// role is mandatory.
    #[must_use]
    pub fn select<S: AsRef<str>>(&self, roles: &[S]) -> Vec<&Machine> {
        let indices: BTreeSet<usize> = roles
            .iter()
            .filter_map(|role| self.labels.get(AsRef::<str>::as_ref(role)))
            .flatten()
            .copied()
            .collect();
        indices
            .into_iter()
            .filter_map(|index| self.machines.get(index))
            .collect()
    }

    /// Machines holding `role`.
    ///
    /// # Errors
    ///
    /// Returns [`UnresolvedRoleError`] when the role selects nothing.
    pub fn require(&self, role: &str) -> Result<Vec<&Machine>, UnresolvedRoleError> {
        let machines = self.get(role);
        if machines.is_empty() {
            return Err(UnresolvedRoleError {
                role: role.to_owned(),
            });
        }
        Ok(machines)
    }

    /// Union of the machines holding each of `roles`, requiring every role
    /// to select at least one machine.
    ///
    /// # Errors
    ///
    /// Returns [`UnresolvedRoleError`] for the first role selecting nothing.
    pub fn require_all<S: AsRef<str>>(
        &self,
        roles: &[S],
    ) -> Result<Vec<&Machine>, UnresolvedRoleError> {
        if let Some(missing) = roles
            .iter()
            .map(AsRef::<str>::as_ref)
            .find(|role| !self.contains(role))
        {
            return Err(UnresolvedRoleError {
                role: missing.to_owned(),
            });
        }
        Ok(self.select(roles))
    }

    /// Roles from `roles` that select no machine, deduplicated and sorted.
    #[must_use]
    pub fn undefined<'a, I>(&self, roles: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        roles
            .into_iter()
            .filter(|role| !self.contains(role))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
