//! `apptainer` software plugin: installs Apptainer from the distribution's
//! package manager.

use serde_json::json;
use tracing::info;

use crate::registry::{InstallContext, Installer, PluginFuture, PluginRegistration};
use crate::remote::{as_root, quote};
use crate::state::EnvironmentPatch;

use super::{RuntimeConfig, install_on_roles, runtime_schema};

/// Kind under which the plugin registers.
pub const KIND: &str = "apptainer";

/// Registration for the registry.
#[must_use]
pub fn registration() -> PluginRegistration<dyn Installer> {
    PluginRegistration::new(KIND, runtime_schema(), |config: RuntimeConfig| -> Box<dyn Installer> {
        Box::new(Apptainer { config })
    })
}

/// Shell command installing Apptainer with `apt` or `dnf`.
#[must_use]
pub fn install_command(version: Option<&str>) -> String {
    let (apt_package, dnf_package) = version.map_or_else(
        || (String::from("apptainer"), String::from("apptainer")),
        |version| {
            (
                quote(&format!("apptainer={version}*")),
                quote(&format!("apptainer-{version}")),
            )
        },
    );
    as_root(&format!(
        "command -v apptainer >/dev/null 2>&1 && exit 0; \
         if command -v apt-get >/dev/null 2>&1; then \
         export DEBIAN_FRONTEND=noninteractive && apt-get update && \
         apt-get install -y software-properties-common && \
         add-apt-repository -y ppa:apptainer/ppa && apt-get update && \
         apt-get install -y {apt_package}; \
         elif command -v dnf >/dev/null 2>&1; then \
         dnf install -y epel-release && dnf install -y {dnf_package}; \
         else echo 'no supported package manager' >&2; exit 1; fi"
    ))
}

struct Apptainer {
    config: RuntimeConfig,
}

impl Installer for Apptainer {
    fn roles(&self) -> Vec<String> {
        self.config.roles.clone()
    }

    fn install<'a>(&'a self, ctx: &'a InstallContext<'a>) -> PluginFuture<'a, EnvironmentPatch> {
        Box::pin(async move {
            let command = install_command(self.config.version.as_deref());
            let machines = install_on_roles(ctx, &self.config.roles, &command).await?;
            info!(machines = machines.len(), "installed apptainer");
            Ok(EnvironmentPatch::new().with(
                KIND,
                json!({"machines": machines, "version": self.config.version}),
            ))
        })
    }
}
