//! Site provisioners: turning site descriptions into machines and tearing
//! them down again.
//!
//! A [`Provisioner`] owns one provider kind. Teardown is a three-step
//! protocol the orchestrator drives in order for every site:
//! [`Provisioner::release_credentials`], [`Provisioner::teardown`], then
//! [`Provisioner::remove_local_state`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use thiserror::Error;

use crate::experiment::SiteSpec;
use crate::files::{self, FileError};
use crate::inventory::Machine;
use crate::registry::UnknownKindError;
use crate::remote::{CommandRequest, CommandRunner, ProcessCommandRunner, RemoteError};
use crate::schema::{self, SchemaViolation};
use crate::settings::KisoSettings;
use crate::state::SiteRecord;

mod static_hosts;
mod vagrant;

pub use static_hosts::StaticProvisioner;
pub use vagrant::{
    SshConfigEntry, VagrantMachine, VagrantProvisioner, parse_ssh_config, render_vagrantfile,
};

/// Future returned by provisioner operations.
pub type ProvisionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// Errors raised by provisioners.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when a site body cannot be used by its provider.
    #[error("site {site}: {message}")]
    Invalid {
        /// Site label.
        site: String,
        /// What is wrong with the body.
        message: String,
    },
    /// Raised when a provider command fails.
    #[error("site {site}: {source}")]
    Command {
        /// Site label.
        site: String,
        /// Underlying command failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when provider files cannot be written or removed.
    #[error(transparent)]
    Files(#[from] FileError),
}

/// One site to provision.
#[derive(Clone, Debug)]
pub struct ProvisionRequest<'a> {
    /// Position of the site in the document.
    pub index: usize,
    /// The site as declared.
    pub site: &'a SiteSpec,
    /// Site label.
    pub label: String,
    /// Local directory the provider may use for its own files.
    pub state_dir: Utf8PathBuf,
    /// Whether existing provider resources should be recreated.
    pub force: bool,
}

/// What provisioning one site produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionedSite {
    /// Machines of the site.
    pub machines: Vec<Machine>,
    /// Keys registered with the local SSH agent.
    pub agent_keys: Vec<Utf8PathBuf>,
    /// Provider data needed for teardown.
    pub backend: Value,
    /// Local provider directory, if the provider created one.
    pub state_dir: Option<Utf8PathBuf>,
}

/// Capability for one provider kind.
pub trait Provisioner: Send + Sync {
    /// Provider kind, the `kind` of the sites it serves.
    fn kind(&self) -> &str;

    /// Schema a site of this kind satisfies.
    fn schema(&self) -> Value;

    /// Creates the machines of a site.
    fn provision<'a>(&'a self, request: &'a ProvisionRequest<'a>) -> ProvisionFuture<'a, ProvisionedSite>;

    /// Removes the site's keys from the local SSH agent.
    fn release_credentials<'a>(&'a self, _record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Destroys the site's resources at the provider.
    fn teardown<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()>;

    /// Deletes the provider's local files for the site.
    fn remove_local_state<'a>(&'a self, record: &'a SiteRecord) -> ProvisionFuture<'a, ()> {
        Box::pin(async move {
            if let Some(dir) = &record.state_dir {
                files::remove_dir_all(dir)?;
            }
            Ok(())
        })
    }
}

struct Entry {
    schema: Value,
    provisioner: Arc<dyn Provisioner>,
}

/// Provisioners keyed by kind.
#[derive(Default)]
pub struct ProvisionerRegistry {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProvisionerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `static` and `vagrant` providers.
    #[must_use]
    pub fn builtin(settings: &KisoSettings) -> Self {
        Self::new()
            .with(StaticProvisioner)
            .with(VagrantProvisioner::new(settings.clone(), ProcessCommandRunner))
    }

    /// Adds `provisioner`, replacing any previous one of the same kind.
    #[must_use]
    pub fn with(mut self, provisioner: impl Provisioner + 'static) -> Self {
        self.entries.insert(
            provisioner.kind().to_owned(),
            Entry {
                schema: provisioner.schema(),
                provisioner: Arc::new(provisioner),
            },
        );
        self
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn entry(&self, kind: &str) -> Result<&Entry, UnknownKindError> {
        self.entries.get(kind).ok_or_else(|| UnknownKindError {
            category: String::from("site"),
            kind: kind.to_owned(),
            available: self.entries.keys().cloned().collect(),
        })
    }

    /// Provisioner for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownKindError`] when nothing serves `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn Provisioner>, UnknownKindError> {
        self.entry(kind).map(|entry| Arc::clone(&entry.provisioner))
    }

    /// Validates every site against the schema of its provider without
    /// touching the provider.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownKindError`] for the first site of an unknown kind.
    /// Schema violations are returned in the `Ok` value.
    pub fn violations(&self, sites: &[SiteSpec]) -> Result<Vec<SchemaViolation>, UnknownKindError> {
        let mut violations = Vec::new();
        for (index, site) in sites.iter().enumerate() {
            let entry = self.entry(&site.kind)?;
            if let Err(found) = schema::validate(&entry.schema, &site.raw, &format!("sites.{index}")) {
                violations.extend(found);
            }
        }
        Ok(violations)
    }
}

/// Local directory of the site at `index` under `output_dir`.
#[must_use]
pub fn site_state_dir(output_dir: &Utf8Path, index: usize, kind: &str) -> Utf8PathBuf {
    output_dir.join("sites").join(format!("{index}-{kind}"))
}

/// Hostname-safe machine identifier derived from the site label.
#[must_use]
pub fn machine_id(kind: &str, label: &str, ordinals: &[usize]) -> String {
    let mut id: String = format!("{kind}-{label}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    for ordinal in ordinals {
        id.push_str(&format!("-{ordinal}"));
    }
    id
}

/// Runs a local provider command and fails on a non-zero exit.
async fn run_local<R: CommandRunner>(
    runner: &R,
    site: &str,
    request: &CommandRequest,
) -> Result<String, ProvisionError> {
    let output = runner
        .run(request)
        .await
        .map_err(|source| ProvisionError::Command {
            site: site.to_owned(),
            source,
        })?;
    if output.is_success() {
        return Ok(output.stdout);
    }
    Err(ProvisionError::Command {
        site: site.to_owned(),
        source: RemoteError::command_failure("local", &request.command_string(), &output),
    })
}

#[cfg(test)]
mod tests;
