//! Diagnostic output for the `kiso` binary.
//!
//! Events go to stderr through a `tracing-subscriber` formatter. The filter
//! comes from `KISO_LOG`, then `RUST_LOG`, then the `-v` count.

use std::env;
use std::io;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable taking precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "KISO_LOG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter `{directive}`: {message}")]
    Filter {
        /// Directive as given.
        directive: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber is already installed.
    #[error("failed to install the log subscriber: {0}")]
    Install(String),
}

/// Default directive for a `-v` count.
#[must_use]
pub const fn verbosity_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "kiso=info",
        1 => "kiso=debug",
        _ => "trace",
    }
}

/// Picks the directive: `kiso_log` wins over `rust_log`, and both win over
/// the verbosity default. Blank values are ignored.
#[must_use]
pub fn select_directive(verbosity: u8, kiso_log: Option<String>, rust_log: Option<String>) -> String {
    [kiso_log, rust_log]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| verbosity_directive(verbosity).to_owned())
}

fn env_filter(verbosity: u8) -> Result<EnvFilter, LoggingError> {
    let directive = select_directive(
        verbosity,
        env::var(LOG_ENV).ok(),
        env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    EnvFilter::try_new(&directive).map_err(|err| LoggingError::Filter {
        message: err.to_string(),
        directive,
    })
}

/// Installs the global subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is malformed or a subscriber is
/// already installed.
pub fn init_tracing(verbosity: u8) -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity)?)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}
