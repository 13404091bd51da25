//! Provisioned machine records.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// SSH connection parameters declared for a single machine.
///
/// Unset fields fall back to the tool settings when commands are built.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshParams {
    /// Remote user to connect as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// TCP port for SSH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Private key used for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    /// Proxy command used to reach the machine, for example a bastion hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_command: Option<String>,
    /// Extra `-o key=value` options passed to SSH.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// A provisioned endpoint produced by a provisioner.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Machine {
    /// Stable identifier, unique across the experiment.
    pub id: String,
    /// Provider kind that created the machine.
    pub provider: String,
    /// Label of the site the machine belongs to.
    pub site: String,
    /// Role labels held by the machine.
    pub roles: BTreeSet<String>,
    /// Reachable addresses in provider order. The first address is the SSH
    /// endpoint.
    pub addresses: Vec<IpAddr>,
    /// Address the provider marks as preferred for intra-experiment traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_address: Option<IpAddr>,
    /// SSH connection parameters.
    #[serde(default)]
    pub ssh: SshParams,
}

impl Machine {
    /// Creates a machine with no roles or addresses.
    #[must_use]
    pub fn new(id: impl Into<String>, provider: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            site: site.into(),
            roles: BTreeSet::new(),
            addresses: Vec::new(),
            preferred_address: None,
            ssh: SshParams::default(),
        }
    }

    /// Adds a role label.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Adds several role labels.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Appends an address unless it is already known.
    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.push_address(address);
        self
    }

    /// Sets the provider-declared preferred address.
    #[must_use]
    pub const fn with_preferred_address(mut self, address: IpAddr) -> Self {
        self.preferred_address = Some(address);
        self
    }

    /// Replaces the SSH parameters.
    #[must_use]
    pub fn with_ssh(mut self, ssh: SshParams) -> Self {
        self.ssh = ssh;
        self
    }

    /// Appends a newly discovered address, keeping existing order.
    pub fn push_address(&mut self, address: IpAddr) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// Address used for SSH connections.
    #[must_use]
    pub fn ssh_address(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }

    /// Folds a duplicate record of the same machine into this one.
    ///
    /// Roles are unioned and unseen addresses are appended; connection
    /// parameters of the first record win.
    pub fn merge(&mut self, other: &Self) {
        self.roles.extend(other.roles.iter().cloned());
        for address in &other.addresses {
            self.push_address(*address);
        }
        if self.preferred_address.is_none() {
            self.preferred_address = other.preferred_address;
        }
    }
}
