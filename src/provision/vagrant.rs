//! `vagrant` provider: local virtual machines on a private network.
//!
//! Each site gets its own Vagrantfile under `<output>/sites/<index>-vagrant`
//! and its own `192.168.<56 + index>.0/24` subnet, so several Vagrant sites
//! can coexist.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::experiment::roles_schema;
use crate::files;
use crate::inventory::{Machine, SshParams};
use crate::remote::{CommandRequest, CommandRunner, CommandTimeout};
use crate::settings::KisoSettings;
use crate::state::SiteRecord;

use super::{
    ProvisionError, ProvisionFuture, ProvisionRequest, ProvisionedSite, Provisioner, machine_id,
    run_local,
};

/// Kind served by [`VagrantProvisioner`].
pub const KIND: &str = "vagrant";

const DEFAULT_BOX: &str = "generic/debian12";
const DEFAULT_FLAVOUR: &str = "tiny";
const FIRST_HOST: u8 = 10;
const FIRST_SUBNET: u8 = 56;

/// CPU count and memory in MiB per flavour.
const FLAVOURS: [(&str, u8, u32); 6] = [
    ("tiny", 1, 512),
    ("small", 1, 1024),
    ("medium", 2, 2048),
    ("big", 3, 3072),
    ("large", 4, 4096),
    ("extra-large", 6, 6144),
];

#[derive(Debug, Deserialize)]
struct VagrantRequest {
    roles: Vec<String>,
    #[serde(default = "one")]
    number: usize,
    #[serde(default)]
    flavour: Option<String>,
    #[serde(default, rename = "box")]
    image: Option<String>,
}

const fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct VagrantResources {
    machines: Vec<VagrantRequest>,
}

#[derive(Debug, Deserialize)]
struct VagrantSite {
    #[serde(default, rename = "box")]
    image: Option<String>,
    resources: VagrantResources,
}

/// A virtual machine declared in the generated Vagrantfile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VagrantMachine {
    /// Machine identifier, also the Vagrant name and hostname.
    pub id: String,
    /// Roles of the machine.
    pub roles: Vec<String>,
    /// Base box.
    pub image: String,
    /// Virtual CPUs.
    pub cpus: u8,
    /// Memory in MiB.
    pub memory: u32,
    /// Address on the site's private network.
    pub address: Ipv4Addr,
}

/// SSH settings reported by `vagrant ssh-config` for one machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SshConfigEntry {
    /// `HostName`.
    pub host_name: Option<String>,
    /// `User`.
    pub user: Option<String>,
    /// `Port`.
    pub port: Option<u16>,
    /// `IdentityFile`.
    pub identity_file: Option<String>,
}

/// Parses `vagrant ssh-config` output into entries keyed by host.
#[must_use]
pub fn parse_ssh_config(text: &str) -> BTreeMap<String, SshConfigEntry> {
    let mut entries: BTreeMap<String, SshConfigEntry> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let Some((key, raw)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let value = raw.trim().trim_matches('"');
        if key == "Host" {
            entries.entry(value.to_owned()).or_default();
            current = Some(value.to_owned());
            continue;
        }
        let Some(entry) = current.as_ref().and_then(|host| entries.get_mut(host)) else {
            continue;
        };
        match key {
            "HostName" => entry.host_name = Some(value.to_owned()),
            "User" => entry.user = Some(value.to_owned()),
            "Port" => entry.port = value.parse().ok(),
            "IdentityFile" => entry.identity_file = Some(value.to_owned()),
            _ => {}
        }
    }
    entries
}

/// Renders the Vagrantfile declaring `machines`.
#[must_use]
pub fn render_vagrantfile(machines: &[VagrantMachine]) -> String {
    let mut lines = vec![String::from("Vagrant.configure(\"2\") do |config|")];
    for machine in machines {
        lines.extend([
            format!("  config.vm.define \"{}\" do |node|", machine.id),
            format!("    node.vm.box = \"{}\"", machine.image),
            format!("    node.vm.hostname = \"{}\"", machine.id),
            format!(
                "    node.vm.network \"private_network\", ip: \"{}\"",
                machine.address
            ),
            String::from("    node.vm.provider \"virtualbox\" do |vb|"),
            format!("      vb.cpus = {}", machine.cpus),
            format!("      vb.memory = {}", machine.memory),
            String::from("    end"),
            String::from("  end"),
        ]);
    }
    lines.push(String::from("end"));
    let mut file = lines.join("\n");
    file.push('\n');
    file
}

fn flavour(name: &str) -> Option<(u8, u32)> {
    FLAVOURS
        .iter()
        .find(|(flavour, _, _)| *flavour == name)
        .map(|(_, cpus, memory)| (*cpus, *memory))
}

fn invalid(label: &str, message: impl Into<String>) -> ProvisionError {
    ProvisionError::Invalid {
        site: label.to_owned(),
        message: message.into(),
    }
}

fn plan_machines(request: &ProvisionRequest<'_>) -> Result<Vec<VagrantMachine>, ProvisionError> {
    let site: VagrantSite = serde_json::from_value(request.site.raw.clone())
        .map_err(|err| invalid(&request.label, err.to_string()))?;
    let subnet = u8::try_from(request.index)
        .ok()
        .and_then(|index| FIRST_SUBNET.checked_add(index))
        .ok_or_else(|| invalid(&request.label, "too many sites for the private address range"))?;
    let mut machines: Vec<VagrantMachine> = Vec::new();
    for (position, declared) in site.resources.machines.iter().enumerate() {
        let flavour_name = declared.flavour.as_deref().unwrap_or(DEFAULT_FLAVOUR);
        let (cpus, memory) = flavour(flavour_name)
            .ok_or_else(|| invalid(&request.label, format!("unknown flavour `{flavour_name}`")))?;
        for n in 1..=declared.number {
            let host = u8::try_from(machines.len())
                .ok()
                .and_then(|offset| FIRST_HOST.checked_add(offset))
                .filter(|candidate| *candidate < u8::MAX)
                .ok_or_else(|| invalid(&request.label, "too many machines for one site"))?;
            machines.push(VagrantMachine {
                id: machine_id(KIND, &request.label, &[position + 1, n]),
                roles: declared.roles.clone(),
                image: declared
                    .image
                    .clone()
                    .or_else(|| site.image.clone())
                    .unwrap_or_else(|| DEFAULT_BOX.to_owned()),
                cpus,
                memory,
                address: Ipv4Addr::new(192, 168, subnet, host),
            });
        }
    }
    Ok(machines)
}

/// Provider for local Vagrant virtual machines.
#[derive(Clone, Debug)]
pub struct VagrantProvisioner<R: CommandRunner> {
    settings: KisoSettings,
    runner: R,
    agent: bool,
}

impl<R: CommandRunner> VagrantProvisioner<R> {
    /// Creates the provider. Keys are registered with the SSH agent when
    /// `SSH_AUTH_SOCK` is set.
    #[must_use]
    pub fn new(settings: KisoSettings, runner: R) -> Self {
        let agent = std::env::var_os("SSH_AUTH_SOCK").is_some_and(|socket| !socket.is_empty());
        Self {
            settings,
            runner,
            agent,
        }
    }

    /// Overrides SSH agent detection.
    #[must_use]
    pub const fn with_agent(mut self, agent: bool) -> Self {
        self.agent = agent;
        self
    }

    fn vagrant(&self, dir: &Utf8Path, args: &[&str]) -> CommandRequest {
        CommandRequest::new(self.settings.vagrant_bin.clone())
            .args(args.iter().map(OsString::from).collect())
            .current_dir(dir)
            .timeout(CommandTimeout::Unbounded)
    }

    fn ssh_add(&self, args: Vec<OsString>) -> CommandRequest {
        CommandRequest::new(self.settings.ssh_add_bin.clone())
            .args(args)
            .timeout(CommandTimeout::Bounded(self.settings.probe_timeout()))
    }

    async fn register_keys(
        &self,
        label: &str,
        machines: &[Machine],
    ) -> Result<Vec<Utf8PathBuf>, ProvisionError> {
        if !self.agent {
            return Ok(Vec::new());
        }
        let keys: Vec<Utf8PathBuf> = machines
            .iter()
            .filter_map(|machine| machine.ssh.identity_file.as_deref())
            .map(Utf8PathBuf::from)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for key in &keys {
            run_local(&self.runner, label, &self.ssh_add(vec![OsString::from(key.as_str())])).await?;
        }
        Ok(keys)
    }
}

fn to_machine(
    planned: &VagrantMachine,
    label: &str,
    ssh: Option<&SshConfigEntry>,
) -> Result<Machine, ProvisionError> {
    let entry = ssh.ok_or_else(|| {
        invalid(label, format!("vagrant ssh-config does not list {}", planned.id))
    })?;
    let endpoint: IpAddr = entry
        .host_name
        .as_deref()
        .unwrap_or("127.0.0.1")
        .parse()
        .map_err(|_| invalid(label, format!("unusable HostName for {}", planned.id)))?;
    let private = IpAddr::V4(planned.address);
    Ok(Machine::new(planned.id.clone(), KIND, label)
        .with_roles(planned.roles.iter().cloned())
        .with_address(endpoint)
        .with_address(private)
        .with_preferred_address(private)
        .with_ssh(SshParams {
            user: entry.user.clone(),
            port: entry.port,
            identity_file: entry.identity_file.clone(),
            ..SshParams::default()
        }))
}

impl<R: CommandRunner + 'static> Provisioner for VagrantProvisioner<R> {
    fn kind(&self) -> &str {
        KIND
    }

    fn schema(&self) -> Value {
        let flavours: Vec<&str> = FLAVOURS.iter().map(|(name, _, _)| *name).collect();
        json!({
            "type": "object",
            "required": ["kind", "resources"],
            "properties": {
                "kind": {"const": KIND},
                "name": {"type": "string", "minLength": 1},
                "box": {"type": "string", "minLength": 1},
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
                                "properties": {
                                    "roles": roles_schema(),
                                    "number": {"type": "integer", "minimum": 1},
                                    "flavour": {"enum": flavours},
                                    "box": {"type": "string", "minLength": 1}
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
            let label = request.label.as_str();
            let planned = plan_machines(request)?;
            let dir = &request.state_dir;
            files::ensure_dir(dir)?;
            let vagrantfile = dir.join("Vagrantfile");
            if request.force && files::exists(&vagrantfile)? {
                run_local(&self.runner, label, &self.vagrant(dir, &["destroy", "-f"])).await?;
            }
            files::write(&vagrantfile, &render_vagrantfile(&planned))?;

            info!(site = label, machines = planned.len(), "starting vagrant machines");
            run_local(&self.runner, label, &self.vagrant(dir, &["up"])).await?;
            let ssh_config = run_local(&self.runner, label, &self.vagrant(dir, &["ssh-config"])).await?;
            let entries = parse_ssh_config(&ssh_config);
            let machines = planned
                .iter()
                .map(|machine| to_machine(machine, label, entries.get(&machine.id)))
                .collect::<Result<Vec<_>, _>>()?;
            let agent_keys = self.register_keys(label, &machines).await?;

            Ok(ProvisionedSite {
                machines,
                agent_keys,
                backend: json!({"vagrantfile": dir.join("Vagrantfile").as_str()}),
                state_dir: Some(dir.clone()),
            })
        })
    }

    fn release_credentials<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            for key in &record.agent_keys {
                let request = self.ssh_add(vec![OsString::from("-d"), OsString::from(key.as_str())]);
                if let Err(err) = run_local(&self.runner, &record.label, &request).await {
                    warn!(site = %record.label, key = %key, error = %err, "failed to remove agent key");
                }
            }
            Ok(())
        })
    }

    fn teardown<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            let Some(dir) = &record.state_dir else {
                return Ok(());
            };
            if !files::exists(&dir.join("Vagrantfile"))? {
                warn!(site = %record.label, "vagrant directory is gone; nothing to destroy");
                return Ok(());
            }
            run_local(&self.runner, &record.label, &self.vagrant(dir, &["destroy", "-f"])).await?;
            info!(site = %record.label, "destroyed vagrant machines");
            Ok(())
        })
    }
}
