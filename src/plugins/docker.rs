//! `docker` software plugin: installs Docker Engine with the upstream
//! convenience script.

use serde_json::json;
use tracing::info;

use crate::registry::{InstallContext, Installer, PluginFuture, PluginRegistration};
use crate::remote::{as_root, quote};
use crate::state::EnvironmentPatch;

use super::{RuntimeConfig, install_on_roles, runtime_schema};

/// Kind under which the plugin registers.
pub const KIND: &str = "docker";

/// Registration for the registry.
#[must_use]
pub fn registration() -> PluginRegistration<dyn Installer> {
    PluginRegistration::new(KIND, runtime_schema(), |config: RuntimeConfig| -> Box<dyn Installer> {
        Box::new(Docker { config })
    })
}

/// Shell command installing Docker, optionally pinned to `version`.
#[must_use]
pub fn install_command(version: Option<&str>) -> String {
    let pin = version.map_or_else(String::new, |version| format!(" --version {}", quote(version)));
    as_root(&format!(
        "command -v docker >/dev/null 2>&1 || \
         {{ curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sh /tmp/get-docker.sh{pin}; }} && \
         systemctl enable --now docker"
    ))
}

struct Docker {
    config: RuntimeConfig,
}

impl Installer for Docker {
    fn roles(&self) -> Vec<String> {
        self.config.roles.clone()
    }

    fn install<'a>(&'a self, ctx: &'a InstallContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            let command = install_command(self.config.version.as_deref());
            let machines = install_on_roles(ctx, &self.config.roles, &command).await?;
            info!(machines = machines.len(), "installed docker");
            Ok(EnvironmentPatch::new().with(
                KIND,
                json!({"machines": machines, "version": self.config.version}),
            ))
        })
    }
}
