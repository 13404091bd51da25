//! `shell` experiment plugin: runs inline scripts on role-selected machines
//! and keeps what they print.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::experiment::{Script, script_schema};
use crate::files;
use crate::registry::{
    ExperimentContext, ExperimentRunner, PluginError, PluginFuture, PluginRegistration,
};
use crate::remote::{CommandTimeout, RemoteError, for_each_machine, script_command};
use crate::state::EnvironmentPatch;

/// Kind under which the plugin registers.
pub const KIND: &str = "shell";

/// Registration for the registry.
#[must_use]
pub fn registration() -> PluginRegistration<dyn ExperimentRunner> {
    PluginRegistration::new(KIND, schema(), |config: ShellConfig| -> Box<dyn ExperimentRunner> {
        Box::new(Shell { config })
    })
}

fn schema() -> Value {
    json!({
        "type": "object",
        "required": ["scripts"],
        "properties": {
            "scripts": {"type": "array", "minItems": 1, "items": script_schema()}
        },
        "additionalProperties": false
    })
}

/// Kind-specific keys of a `shell` experiment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    /// Scripts run in order.
    pub scripts: Vec<Script>,
}

struct Shell {
    config: ShellConfig,
}

impl ExperimentRunner for Shell {
    fn roles(&self) -> Vec<String> {
        self.config
            .scripts
            .iter()
            .flat_map(|script| script.roles.iter().cloned())
            .collect()
    }

    fn run<'a>(&'a self, ctx: &'a ExperimentContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            for (index, script) in self.config.scripts.iter().enumerate() {
                run_one(ctx, index, script).await?;
            }
            Ok(EnvironmentPatch::new())
        })
    }
}

/// Runs one script everywhere, saving each machine's stdout and stderr under
/// `script-<index>/` even when the script fails.
async fn run_one(
    ctx: &ExperimentContext<'_>,
    index: usize,
    script: &Script,
) -> Result<(), PluginError> {
    let machines = ctx.roles.require_all(&script.roles)?;
    let command = script_command(script, ctx.remote_working_dir, ctx.variables);
    let command_ref = command.as_str();
    let outputs = for_each_machine(&machines, ctx.options.max_workers, |machine| async move {
        let output = ctx
            .remote
            .exec(machine, command_ref, CommandTimeout::Unbounded)
            .await?;
        Ok::<_, RemoteError>((machine, output))
    })
    .await?;

    let log_dir = ctx.result_dir.join(format!("script-{index}"));
    files::ensure_dir(&log_dir)?;
    let mut failed = Vec::new();
    for (machine, output) in &outputs {
        files::write(&log_dir.join(format!("{}.stdout", machine.id)), &output.stdout)?;
        files::write(&log_dir.join(format!("{}.stderr", machine.id)), &output.stderr)?;
        if !output.is_success() {
            warn!(
                experiment = ctx.name,
                machine = %machine.id,
                status = %output.status_text(),
                "script failed"
            );
            failed.push(machine.id.as_str());
        }
    }
    if !failed.is_empty() {
        return Err(PluginError::Failed {
            message: format!("script {index} failed on {}", failed.join(", ")),
        });
    }
    info!(experiment = ctx.name, script = index, machines = outputs.len(), "script finished");
    Ok(())
}
