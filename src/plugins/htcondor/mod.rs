//! `htcondor` deployment plugin: builds an HTCondor pool across the
//! machines of the experiment.
//!
//! Each section key names a daemon group (`central-manager`, `submit[-N]`,
//! `execute[-N]`, `personal[-N]`) bound to roles. A machine can run several
//! daemons; it receives one `01-kiso` fragment covering all of them. The
//! central manager is configured before anything else so the other daemons
//! find their collector when they start.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::experiment::roles_schema;
use crate::inventory::{Machine, RoleMap};
use crate::registry::{InstallContext, Installer, PluginError, PluginFuture, PluginRegistration};
use crate::remote::{CommandTimeout, as_root, exec_checked, exec_with_retry, for_each_machine, quote};
use crate::state::{Environment, EnvironmentPatch};

mod config;

pub use config::{
    CONFIG_DIR, DaemonKind, KISO_CONFIG_FILE, TRUST_DOMAIN, render_config, user_config_name,
};

/// Kind under which the plugin registers.
pub const KIND: &str = "htcondor";

const INSTALL_COMMAND: &str = "command -v condor_version >/dev/null 2>&1 || \
     curl -fsSL https://get.htcondor.org | /bin/bash -s -- --no-dry-run";

/// Registration for the registry.
#[must_use]
pub fn registration() -> PluginRegistration<dyn Installer> {
    PluginRegistration::new(KIND, schema(), |config: HtcondorConfig| -> Box<dyn Installer> {
        Box::new(Htcondor::new(config))
    })
}

fn schema() -> Value {
    let daemon = json!({
        "type": "object",
        "required": ["roles"],
        "properties": {
            "roles": roles_schema(),
            "config-file": {"type": "string", "minLength": 1}
        },
        "additionalProperties": false
    });
    json!({
        "type": "object",
        "minProperties": 1,
        "properties": {"central-manager": daemon.clone()},
        "patternProperties": {"^(personal|execute|submit)(-[0-9]+)?$": daemon},
        "additionalProperties": false
    })
}

/// One daemon group of the section.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DaemonSection {
    /// Roles whose machines run the daemon.
    pub roles: Vec<String>,
    /// Local fragment installed next to the generated one.
    #[serde(default)]
    pub config_file: Option<String>,
}

/// The `htcondor` section: daemon groups keyed by name.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct HtcondorConfig(pub BTreeMap<String, DaemonSection>);

#[derive(Debug)]
struct DaemonGroup {
    name: String,
    kind: DaemonKind,
    section: DaemonSection,
}

struct Htcondor {
    groups: Vec<DaemonGroup>,
    unknown: Vec<String>,
}

/// What one machine runs.
#[derive(Debug)]
struct MachinePlan<'m> {
    machine: &'m Machine,
    daemons: BTreeSet<DaemonKind>,
    config_files: Vec<(String, String)>,
}

impl MachinePlan<'_> {
    fn rank(&self) -> u8 {
        self.daemons
            .iter()
            .map(|daemon| daemon.rank())
            .min()
            .unwrap_or(u8::MAX)
    }
}

impl Htcondor {
    fn new(config: HtcondorConfig) -> Self {
        let mut groups = Vec::new();
        let mut unknown = Vec::new();
        for (name, section) in config.0 {
            let Some(kind) = DaemonKind::from_key(&name) else {
                unknown.push(name);
                continue;
            };
            groups.push(DaemonGroup {
                name,
                kind,
                section,
            });
        }
        groups.sort_by_key(|group| group.kind.rank());
        Self { groups, unknown }
    }

    fn groups_of(&self, kind: DaemonKind) -> impl Iterator<Item = &DaemonGroup> {
        self.groups.iter().filter(move |group| group.kind == kind)
    }

    fn overlap_problems(&self, kind: DaemonKind, roles: &RoleMap) -> Vec<String> {
        let groups: Vec<&DaemonGroup> = self.groups_of(kind).collect();
        let mut problems = Vec::new();
        for (position, first) in groups.iter().enumerate() {
            let first_ids: BTreeSet<&str> = roles
                .select(&first.section.roles)
                .into_iter()
                .map(|machine| machine.id.as_str())
                .collect();
            for second in groups.iter().skip(position + 1) {
                let shared: Vec<&str> = roles
                    .select(&second.section.roles)
                    .into_iter()
                    .map(|machine| machine.id.as_str())
                    .filter(|id| first_ids.contains(id))
                    .collect();
                if !shared.is_empty() {
                    problems.push(format!(
                        "{kind} groups `{}` and `{}` overlap on {}",
                        first.name,
                        second.name,
                        shared.join(", ")
                    ));
                }
            }
        }
        problems
    }

    /// Assigns daemons and fragments to machines, central manager first.
    fn plan<'m>(&self, roles: &'m RoleMap) -> Result<Vec<MachinePlan<'m>>, PluginError> {
        let mut plans: BTreeMap<&str, MachinePlan<'m>> = BTreeMap::new();
        for group in &self.groups {
            for machine in roles.require_all(&group.section.roles)? {
                let plan = plans.entry(machine.id.as_str()).or_insert_with(|| MachinePlan {
                    machine,
                    daemons: BTreeSet::new(),
                    config_files: Vec::new(),
                });
                plan.daemons.insert(group.kind);
                if let Some(path) = &group.section.config_file {
                    plan.config_files.push((group.name.clone(), path.clone()));
                }
            }
        }
        let mut ordered: Vec<MachinePlan<'m>> = plans.into_values().collect();
        ordered.sort_by_key(MachinePlan::rank);
        Ok(ordered)
    }
}

impl Installer for Htcondor {
    fn roles(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|group| group.section.roles.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn check(&self, roles: &RoleMap) -> Vec<String> {
        let mut problems: Vec<String> = self
            .unknown
            .iter()
            .map(|name| format!("unknown daemon group `{name}`"))
            .collect();
        for group in &self.groups {
            problems.extend(
                roles
                    .undefined(&group.section.roles)
                    .into_iter()
                    .map(|role| format!("{} references undefined role `{role}`", group.name)),
            );
        }

        let managers: Vec<&DaemonGroup> = self.groups_of(DaemonKind::CentralManager).collect();
        match managers.as_slice() {
            [] => {
                for group in self
                    .groups
                    .iter()
                    .filter(|group| matches!(group.kind, DaemonKind::Execute | DaemonKind::Submit))
                {
                    problems.push(format!("{} requires a central-manager", group.name));
                }
            }
            [manager] => {
                let count = roles.select(&manager.section.roles).len();
                if roles.undefined(&manager.section.roles).is_empty() && count != 1 {
                    problems.push(format!(
                        "central-manager must resolve to exactly one machine, found {count}"
                    ));
                }
            }
            _ => problems.push(String::from("only one central-manager group is allowed")),
        }

        problems.extend(self.overlap_problems(DaemonKind::Execute, roles));
        problems.extend(self.overlap_problems(DaemonKind::Submit, roles));
        problems
    }

    fn install<'a>(&'a self, ctx: &'a InstallContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            let plans = self.plan(ctx.roles)?;
            let manager = plans
                .iter()
                .find(|plan| plan.daemons.contains(&DaemonKind::CentralManager))
                .map(|plan| plan.machine);
            let manager_address = manager.and_then(|machine| ctx.host_map.get(&machine.id));
            let password = pool_password(ctx.environment);
            let installer = PoolInstaller {
                ctx,
                manager_address,
                password: &password,
            };

            let first = plans
                .first()
                .filter(|plan| plan.daemons.contains(&DaemonKind::CentralManager));
            let rest = plans
                .get(usize::from(first.is_some())..)
                .unwrap_or_default();
            if let Some(plan) = first {
                installer.configure(plan).await?;
            }
            let machines: Vec<&Machine> = rest.iter().map(|plan| plan.machine).collect();
            let by_id: BTreeMap<&str, &MachinePlan<'_>> = rest
                .iter()
                .map(|plan| (plan.machine.id.as_str(), plan))
                .collect();
            let installer_ref = &installer;
            let by_id_ref = &by_id;
            for_each_machine(&machines, ctx.options.max_workers, |machine| async move {
                let Some(plan) = by_id_ref.get(machine.id.as_str()) else {
                    return Ok(());
                };
                installer_ref.configure(plan).await
            })
            .await?;

            info!(machines = plans.len(), "deployed htcondor pool");
            let daemons: BTreeMap<&str, Vec<String>> = plans
                .iter()
                .map(|plan| {
                    (
                        plan.machine.id.as_str(),
                        plan.daemons.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect();
            Ok(EnvironmentPatch::new().with(
                KIND,
                json!({
                    "central-manager": manager.map(|machine| machine.id.clone()),
                    "trust-domain": TRUST_DOMAIN,
                    PASSWORD_KEY: &password,
                    "daemons": daemons,
                }),
            ))
        })
    }
}

struct PoolInstaller<'a> {
    ctx: &'a InstallContext<'a>,
    manager_address: Option<IpAddr>,
    password: &'a str,
}

impl PoolInstaller<'_> {
    const fn timeout(&self) -> CommandTimeout {
        CommandTimeout::Bounded(self.ctx.options.command_timeout)
    }

    async fn configure(&self, plan: &MachinePlan<'_>) -> Result<(), PluginError> {
        let machine = plan.machine;
        debug!(machine = %machine.id, daemons = ?plan.daemons, "configuring htcondor");
        exec_with_retry(
            self.ctx.remote,
            machine,
            &as_root(INSTALL_COMMAND),
            CommandTimeout::Unbounded,
            self.ctx.options.retry,
        )
        .await?;

        for (group, path) in &plan.config_files {
            self.install_user_config(machine, group, path).await?;
        }

        let interface = self.ctx.host_map.get(&machine.id).ok_or_else(|| PluginError::Failed {
            message: format!("machine {} is missing from the host map", machine.id),
        })?;
        let fragment = render_config(&plan.daemons, self.manager_address, interface).join("\n");
        let write_fragment = format!(
            "printf '%s\\n' {} > {CONFIG_DIR}/{KISO_CONFIG_FILE} && rm -f {CONFIG_DIR}/00-minicondor",
            quote(&fragment)
        );
        exec_checked(self.ctx.remote, machine, &as_root(&write_fragment), self.timeout()).await?;
        exec_checked(
            self.ctx.remote,
            machine,
            &as_root(&security_command(self.password)),
            self.timeout(),
        )
        .await?;
        exec_checked(
            self.ctx.remote,
            machine,
            &as_root("systemctl restart condor"),
            self.timeout(),
        )
        .await?;
        Ok(())
    }

    async fn install_user_config(
        &self,
        machine: &Machine,
        group: &str,
        path: &str,
    ) -> Result<(), PluginError> {
        let local = resolve_local(self.ctx.working_dir, path);
        let name = user_config_name(group);
        let staging = format!("{}/{name}", self.ctx.options.remote_root);
        exec_checked(
            self.ctx.remote,
            machine,
            &format!("mkdir -p {}", quote(&self.ctx.options.remote_root)),
            self.timeout(),
        )
        .await?;
        self.ctx.remote.push(machine, &local, &staging).await?;
        exec_checked(
            self.ctx.remote,
            machine,
            &as_root(&format!(
                "install -m 644 {} {CONFIG_DIR}/{name}",
                quote(&staging)
            )),
            self.timeout(),
        )
        .await?;
        Ok(())
    }
}

fn resolve_local(working_dir: &Utf8Path, path: &str) -> Utf8PathBuf {
    let candidate = Utf8Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_dir.join(candidate)
    }
}

/// Environment key, under [`KIND`], holding the pool password.
pub const PASSWORD_KEY: &str = "pool-password";

/// Password recorded by an earlier install, or a fresh one. Reinstalls keep
/// the pool password so nodes configured earlier stay in the pool.
#[must_use]
pub fn pool_password(environment: &Environment) -> String {
    environment
        .get(KIND)
        .and_then(|recorded| recorded.get(PASSWORD_KEY))
        .and_then(Value::as_str)
        .map_or_else(|| Uuid::new_v4().simple().to_string(), str::to_owned)
}

/// Shell command storing the pool password and minting the pool token.
#[must_use]
pub fn security_command(password: &str) -> String {
    format!(
        "pwdir=$(condor_config_val SEC_PASSWORD_DIRECTORY) && \
         tokdir=$(condor_config_val SEC_TOKEN_SYSTEM_DIRECTORY) && \
         printf '%s' {password} > \"$pwdir/POOL\" && \
         chown root:root \"$pwdir/POOL\" && chmod 600 \"$pwdir/POOL\" && \
         condor_token_create -key POOL -identity condor_pool@{TRUST_DOMAIN} -file \"$tokdir/POOL.token\"",
        password = quote(password)
    )
}

#[cfg(test)]
mod tests;
