//! Built-in plugins.
//!
//! | Category   | Kind        |
//! |------------|-------------|
//! | software   | `docker`    |
//! | software   | `apptainer` |
//! | deployment | `htcondor`  |
//! | experiment | `shell`     |

use serde::Deserialize;
use serde_json::{Value, json};

use crate::experiment::roles_schema;
use crate::registry::{InstallContext, PluginError, PluginRegistryBuilder};
use crate::remote::{CommandTimeout, exec_with_retry, for_each_machine};

pub mod apptainer;
pub mod docker;
pub mod htcondor;
pub mod shell;

/// Adds every built-in plugin to `builder`.
#[must_use]
pub fn register(builder: PluginRegistryBuilder) -> PluginRegistryBuilder {
    builder
        .software(docker::registration())
        .software(apptainer::registration())
        .deployment(htcondor::registration())
        .experiment(shell::registration())
}

/// Configuration shared by container runtimes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Roles receiving the runtime.
    pub roles: Vec<String>,
    /// Version to pin; the latest release otherwise.
    #[serde(default)]
    pub version: Option<String>,
}

fn runtime_schema() -> Value {
    json!({
        "type": "object",
        "required": ["roles"],
        "properties": {
            "roles": roles_schema(),
            "version": {"type": "string", "minLength": 1}
        },
        "additionalProperties": false
    })
}

/// Runs `command` on every machine of `roles` with package retries and
/// returns the identifiers of the machines.
async fn install_on_roles(
    ctx: &InstallContext<'_>,
    roles: &[String],
    command: &str,
) -> Result<Vec<String>, PluginError> {
    let machines = ctx.roles.require_all(roles)?;
    for_each_machine(&machines, ctx.options.max_workers, |machine| async move {
        exec_with_retry(
            ctx.remote,
            machine,
            command,
            CommandTimeout::Unbounded,
            ctx.options.retry,
        )
        .await
    })
    .await?;
    Ok(machines.iter().map(|machine| machine.id.clone()).collect())
}
