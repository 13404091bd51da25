//! Host map: one preferred address per machine, written to `/etc/hosts`.
//!
//! The map is rendered as a delimited block so redistributing it replaces
//! the previous block instead of appending a second one.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tracing::info;

use crate::inventory::{Machine, RoleMap};
use crate::remote::{
    CommandTimeout, RemoteError, RemoteRunner, as_root, exec_checked, for_each_machine, quote,
};

/// First line of the managed block.
pub const HOSTS_BEGIN: &str = "# BEGIN KISO HOSTS";
/// Last line of the managed block.
pub const HOSTS_END: &str = "# END KISO HOSTS";
/// Environment key recording the local copy of the host map.
pub const HOSTS_FILE_KEY: &str = "hosts-file";

/// Errors raised while building or distributing the host map.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostMapError {
    /// Raised when every address of a machine is unusable.
    #[error("machine {machine} has no usable address for the host map")]
    NoUsableAddress {
        /// Machine identifier.
        machine: String,
    },
    /// Raised when writing the map on a machine fails.
    #[error("failed to distribute the host map: {0}")]
    Distribution(#[from] RemoteError),
}

fn is_usable_v4(address: Ipv4Addr) -> bool {
    let [first, ..] = address.octets();
    let reserved = first >= 240;
    !(address.is_loopback()
        || address.is_unspecified()
        || address.is_multicast()
        || address.is_link_local()
        || address.is_broadcast()
        || address.is_documentation()
        || reserved)
}

fn is_usable_v6(address: Ipv6Addr) -> bool {
    let [first, second, ..] = address.segments();
    let link_local = first & 0xffc0 == 0xfe80;
    let documentation = first == 0x2001 && second == 0x0db8;
    !(address.is_loopback()
        || address.is_unspecified()
        || address.is_multicast()
        || link_local
        || documentation)
}

fn is_usable(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => is_usable_v4(v4),
        IpAddr::V6(v6) => is_usable_v6(v6),
    }
}

fn is_private(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            let [first, second, ..] = v4.octets();
            let shared = first == 100 && (second & 0xc0) == 64;
            v4.is_private() || shared
        }
        IpAddr::V6(v6) => {
            let [first, ..] = v6.segments();
            first & 0xfe00 == 0xfc00
        }
    }
}

/// Address other machines should use to reach `machine`.
///
/// A provider-declared preferred address wins. Otherwise unusable addresses
/// are discarded and the rest ranked public before private, then IPv4
/// before IPv6, keeping provider order among equals.
#[must_use]
pub fn preferred_address(machine: &Machine) -> Option<IpAddr> {
    if let Some(address) = machine.preferred_address {
        return Some(address);
    }
    machine
        .addresses
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, address)| is_usable(*address))
        .min_by_key(|(index, address)| (is_private(*address), address.is_ipv6(), *index))
        .map(|(_, address)| address)
}

/// Machine identifier to preferred address, sorted by identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostMap {
    entries: BTreeMap<String, IpAddr>,
}

impl HostMap {
    /// Builds the map for every machine of `roles`.
    ///
    /// # Errors
    ///
    /// Returns [`HostMapError::NoUsableAddress`] for the first machine with
    /// no usable address.
    pub fn generate(roles: &RoleMap) -> Result<Self, HostMapError> {
        let entries = roles
            .machines()
            .iter()
            .map(|machine| {
                preferred_address(machine)
                    .map(|address| (machine.id.clone(), address))
                    .ok_or_else(|| HostMapError::NoUsableAddress {
                        machine: machine.id.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Preferred address of machine `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<IpAddr> {
        self.entries.get(id).copied()
    }

    /// Returns `true` when the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the delimited hosts block.
    #[must_use]
    pub fn render(&self) -> String {
        let mut rendered = format!("{HOSTS_BEGIN}\n");
        for (id, address) in &self.entries {
            rendered.push_str(&format!("{address} {id}\n"));
        }
        rendered.push_str(HOSTS_END);
        rendered.push('\n');
        rendered
    }

    /// Shell command replacing the managed block of `/etc/hosts`.
    #[must_use]
    pub fn install_command(&self) -> String {
        let script = format!(
            "sed -i '/^{HOSTS_BEGIN}$/,/^{HOSTS_END}$/d' /etc/hosts && \
             {{ [ -z \"$(tail -c1 /etc/hosts)\" ] || echo >> /etc/hosts; }} && \
             printf '%s' {} >> /etc/hosts",
            quote(&self.render())
        );
        as_root(&script)
    }

    /// Writes the map on every machine with at most `max_workers` in flight.
    ///
    /// # Errors
    ///
    /// Returns [`HostMapError::Distribution`] for the first machine, in
    /// input order, where writing failed.
    pub async fn distribute(
        &self,
        remote: &dyn RemoteRunner,
        machines: &[&Machine],
        max_workers: usize,
        timeout: CommandTimeout,
    ) -> Result<(), HostMapError> {
        let command = self.install_command();
        let script = command.as_str();
        for_each_machine(machines, max_workers, |machine| async move {
            exec_checked(remote, machine, script, timeout).await
        })
        .await?;
        info!(machines = machines.len(), "distributed host map");
        Ok(())
    }
}
