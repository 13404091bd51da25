//! Tool settings for SSH access, transfer binaries, and execution limits.
//!
//! [`KisoSettings`] is loaded via `ortho-config`, which merges defaults,
//! `kiso.toml` discovery, and `KISO_*` environment variables. Experiment
//! documents are separate; see [`crate::experiment`].

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::remote::RetryPolicy;

/// Default number of concurrent per-machine operations within a stage.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default remote directory, relative to the SSH user's home, that receives
/// experiment working directories.
pub const DEFAULT_REMOTE_ROOT: &str = "kiso";

/// SSH, transfer, and execution settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KISO",
    discovery(
        app_name = "kiso",
        env_var = "KISO_CONFIG_PATH",
        config_file_name = "kiso.toml",
        dotfile_name = ".kiso.toml",
        project_file_name = "kiso.toml"
    )
)]
pub struct KisoSettings {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `ssh-add` executable used to manage agent keys.
    #[ortho_config(default = "ssh-add".to_owned())]
    pub ssh_add_bin: String,
    /// Path to the `vagrant` executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
    /// Remote user to connect as when a machine does not declare one.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled by default because
    /// provisioned machines are short-lived.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used when a machine does not declare its own. Supports
    /// tilde expansion. Validation rejects empty or whitespace-only values.
    pub ssh_identity_file: Option<String>,
    /// Remote directory, relative to the SSH user's home, that receives the
    /// experiment working directory.
    #[ortho_config(default = DEFAULT_REMOTE_ROOT.to_owned())]
    pub remote_root: String,
    /// Timeout applied to ordinary remote commands, in seconds.
    #[ortho_config(default = 300)]
    pub command_timeout_secs: u64,
    /// Timeout applied to TCP reachability probes, in seconds.
    #[ortho_config(default = 5)]
    pub probe_timeout_secs: u64,
    /// Attempts made for package-manager commands before giving up.
    #[ortho_config(default = 3)]
    pub package_retries: u32,
    /// Delay between package-manager attempts, in seconds.
    #[ortho_config(default = 10)]
    pub package_retry_delay_secs: u64,
    /// Upper bound on concurrent per-machine operations.
    #[ortho_config(default = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,
}

/// Errors raised while loading or validating settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is empty. The message names the
    /// environment variable and file key that provide it.
    #[error("missing {field}: set KISO_{env_suffix} or add {field} to kiso.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Settings field that failed validation.
        field: String,
    },
    /// Raised when a numeric limit is zero.
    #[error("{field} must be greater than zero")]
    ZeroLimit {
        /// Settings field that failed validation.
        field: String,
    },
}

impl KisoSettings {
    /// Loads settings from defaults, configuration files, and environment
    /// variables without consulting the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        Self::load_from_iter([std::ffi::OsString::from("kiso")])
            .map_err(|err| SettingsError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace and
    /// that limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidConfig`] when a required field is
    /// empty, or [`SettingsError::ZeroLimit`] when a limit is zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.ssh_add_bin, "ssh_add_bin")?;
        Self::require_value(&self.vagrant_bin, "vagrant_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_value(&self.remote_root, "remote_root")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        Self::reject_zero(self.max_workers == 0, "max_workers")?;
        Self::reject_zero(self.package_retries == 0, "package_retries")?;
        Self::reject_zero(self.command_timeout_secs == 0, "command_timeout_secs")?;
        Ok(())
    }

    /// Derives the per-stage execution limits used by the orchestrator.
    #[must_use]
    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            max_workers: self.max_workers.max(1),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            retry: RetryPolicy::new(
                self.package_retries,
                Duration::from_secs(self.package_retry_delay_secs),
            ),
            remote_root: self.remote_root.clone(),
        }
    }

    /// Timeout applied to reachability probes.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SettingsError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SettingsError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SettingsError> {
        Self::require_optional_value(Some(value), field)
    }

    fn reject_zero(is_zero: bool, field: &str) -> Result<(), SettingsError> {
        if is_zero {
            return Err(SettingsError::ZeroLimit {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}

/// Execution limits shared by every stage of the lifecycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleOptions {
    /// Upper bound on concurrent per-machine operations.
    pub max_workers: usize,
    /// Timeout applied to ordinary remote commands.
    pub command_timeout: Duration,
    /// Retry budget for package-manager commands.
    pub retry: RetryPolicy,
    /// Remote directory receiving experiment working directories.
    pub remote_root: String,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            command_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            remote_root: DEFAULT_REMOTE_ROOT.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests;
