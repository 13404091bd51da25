//! `static` provider: machines that already exist.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::experiment::roles_schema;
use crate::inventory::{Machine, SshParams};
use crate::state::SiteRecord;

use super::{ProvisionError, ProvisionFuture, ProvisionRequest, ProvisionedSite, Provisioner, machine_id};

/// Kind served by [`StaticProvisioner`].
pub const KIND: &str = "static";

/// Provider for pre-existing hosts. Teardown leaves the hosts untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticProvisioner;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StaticHost {
    roles: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<IpAddr>,
    #[serde(default)]
    addresses: Vec<IpAddr>,
    #[serde(default)]
    preferred_address: Option<IpAddr>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    identity_file: Option<String>,
    #[serde(default)]
    proxy_command: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StaticResources {
    machines: Vec<StaticHost>,
}

#[derive(Debug, Deserialize)]
struct StaticSite {
    resources: StaticResources,
}

impl StaticHost {
    fn into_machine(self, id: String, label: &str) -> Machine {
        let addresses = self.address.into_iter().chain(self.addresses);
        let mut machine = addresses.fold(Machine::new(id, KIND, label), Machine::with_address);
        machine = machine.with_roles(self.roles).with_ssh(SshParams {
            user: self.user,
            port: self.port,
            identity_file: self.identity_file,
            proxy_command: self.proxy_command,
            options: self.options,
        });
        if let Some(preferred) = self.preferred_address {
            machine = machine.with_preferred_address(preferred);
        }
        machine
    }
}

impl Provisioner for StaticProvisioner {
    fn kind(&self) -> &str {
        KIND
    }

    fn schema(&self) -> Value {
        let address = json!({"type": "string", "minLength": 2});
        json!({
            "type": "object",
            "required": ["kind", "resources"],
            "properties": {
                "kind": {"const": KIND},
                "name": {"type": "string", "minLength": 1},
                "resources": {
                    "type": "object",
                    "required": ["machines"],
                    "properties": {
                        "machines": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["roles"],
                                "anyOf": [
                                    {"required": ["address"]},
                                    {"required": ["addresses"]}
                                ],
                                "properties": {
                                    "roles": roles_schema(),
                                    "number": {"const": 1},
                                    "name": {"type": "string", "pattern": "^[a-zA-Z0-9][a-zA-Z0-9.-]*$"},
                                    "address": address.clone(),
                                    "addresses": {"type": "array", "minItems": 1, "items": address.clone()},
                                    "preferred-address": address,
                                    "user": {"type": "string", "minLength": 1},
                                    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                                    "identity-file": {"type": "string", "minLength": 1},
                                    "proxy-command": {"type": "string", "minLength": 1},
                                    "options": {
                                        "type": "object",
                                        "additionalProperties": {"type": "string"}
                                    }
                                },
                                "additionalProperties": false
                            }
                        }
                    },
                    "additionalProperties": false
                }
            },
            "additionalProperties": false
        })
    }

    fn provision<'a>(&'a self, request: &'a ProvisionRequest<'a>) -> ProvisionFuture<'a, ProvisionedSite> {
        Box::pin(async move {
            let site: StaticSite =
                serde_json::from_value(request.site.raw.clone()).map_err(|err| ProvisionError::Invalid {
                    site: request.label.clone(),
                    message: err.to_string(),
                })?;
            let machines: Vec<Machine> = site
                .resources
                .machines
                .into_iter()
                .enumerate()
                .map(|(position, host)| {
                    let id = host
                        .name
                        .clone()
                        .unwrap_or_else(|| machine_id(KIND, &request.label, &[position + 1]));
                    host.into_machine(id, &request.label)
                })
                .collect();
            if let Some(machine) = machines.iter().find(|machine| machine.addresses.is_empty()) {
                return Err(ProvisionError::Invalid {
                    site: request.label.clone(),
                    message: format!("machine {} declares no address", machine.id),
                });
            }
            info!(site = %request.label, machines = machines.len(), "registered static hosts");
            Ok(ProvisionedSite {
                machines,
                ..ProvisionedSite::default()
            })
        })
    }

    fn teardown<'a>(&'a self, _record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
