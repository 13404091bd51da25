//! Binary entry point for the `kiso` CLI.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::info;

use kiso::experiment::ExperimentSpec;
use kiso::logging::{self, LoggingError};
use kiso::orchestrator::{
    CheckedExperiment, DownOutcome, LifecycleError, Orchestrator, RunOptions, RunSummary,
    UpOutcome, check,
};
use kiso::provision::ProvisionerRegistry;
use kiso::registry::PluginRegistry;
use kiso::remote::{ProcessCommandRunner, Remote};
use kiso::settings::{KisoSettings, SettingsError};
use kiso::state::StateStore;
use kiso::transport::TcpReachability;

mod cli;

use cli::{Cli, Command};

/// Exit code reported when the user interrupts a command.
const INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Settings(#[from] SettingsError),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("{count} experiment(s) failed: {names}")]
    ExperimentsFailed { count: usize, names: String },
}

/// Everything a command needs besides its arguments.
struct Session {
    registry: PluginRegistry,
    orchestrator: Orchestrator,
}

impl Session {
    fn new() -> Result<Self, CliError> {
        let settings = KisoSettings::load_without_cli_args()?;
        settings.validate()?;
        let registry = PluginRegistry::builtin().map_err(LifecycleError::from)?;
        let provisioners = ProvisionerRegistry::builtin(&settings);
        let options = settings.lifecycle_options();
        let reachability = TcpReachability::new(settings.probe_timeout());
        let remote = Remote::new(settings, ProcessCommandRunner, reachability)?;
        Ok(Self {
            registry,
            orchestrator: Orchestrator::new(provisioners, Arc::new(remote), options),
        })
    }

    fn check(&self, config: &Utf8Path) -> Result<CheckedExperiment, CliError> {
        let spec = ExperimentSpec::load(config).map_err(LifecycleError::from)?;
        check(spec, &self.registry, self.orchestrator.provisioners()).map_err(CliError::from)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init_tracing(cli.verbose) {
        report_logging_error(&err);
    }

    let exit_code = tokio::select! {
        result = dispatch(cli.command) => match result {
            Ok(()) => 0,
            Err(err) => {
                report_error(&err);
                1
            }
        },
        () = interrupted() => {
            writeln!(io::stderr(), "interrupted").ok();
            INTERRUPTED
        }
    };

    process::exit(exit_code);
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let session = Session::new()?;
    match command {
        Command::Check(args) => {
            let config = utf8_path(args.document.config)?;
            let checked = session.check(&config)?;
            let spec = checked.spec();
            say(&format!(
                "{config}: experiment `{}` is valid ({} site(s), {} experiment(s))",
                spec.name,
                spec.sites.len(),
                spec.experiments.len()
            ));
            Ok(())
        }
        Command::Up(args) => {
            let checked = session.check(&utf8_path(args.document.config)?)?;
            let store = StateStore::open(&utf8_path(args.output.output)?);
            let outcome = session
                .orchestrator
                .up(&checked, &store, args.force)
                .await?;
            say(&render_up(outcome, store.output_dir()));
            Ok(())
        }
        Command::Run(args) => {
            let checked = session.check(&utf8_path(args.document.config)?)?;
            let store = StateStore::open(&utf8_path(args.output.output)?);
            let options = RunOptions {
                force: args.force,
                keep_going: args.keep_going,
            };
            let summary = session.orchestrator.run(&checked, &store, options).await?;
            say(&render_run(&summary));
            failures(&summary)
        }
        Command::Down(args) => {
            let config = utf8_path(args.document.config)?;
            let store = StateStore::open(&utf8_path(args.output.output)?);
            info!(%config, output = %store.output_dir(), "tearing down");
            let outcome = session.orchestrator.down(&store).await?;
            say(&render_down(outcome));
            Ok(())
        }
    }
}

fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path).map_err(|raw| CliError::NonUtf8Path(raw.display().to_string()))
}

fn render_up(outcome: UpOutcome, output: &Utf8Path) -> String {
    match outcome {
        UpOutcome::AlreadyUp => format!("{output}: already up; use --force to start over"),
        UpOutcome::Completed => format!("{output}: up"),
    }
}

fn render_run(summary: &RunSummary) -> String {
    let mut lines = vec![format!(
        "{} iteration(s) completed, {} skipped, {} experiment(s) failed",
        summary.completed.len(),
        summary.skipped.len(),
        summary.failures.len()
    )];
    lines.extend(
        summary
            .warnings
            .iter()
            .map(|warning| format!("warning: {warning}")),
    );
    lines.join("\n")
}

fn render_down(outcome: DownOutcome) -> String {
    match outcome {
        DownOutcome::NothingProvisioned => String::from("nothing is provisioned"),
        DownOutcome::TornDown { sites } => format!("{sites} site(s) torn down"),
    }
}

fn failures(summary: &RunSummary) -> Result<(), CliError> {
    if summary.is_success() {
        return Ok(());
    }
    Err(CliError::ExperimentsFailed {
        count: summary.failures.len(),
        names: summary
            .failures
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn say(message: &str) {
    writeln!(io::stdout(), "{message}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn report_logging_error(err: &LoggingError) {
    writeln!(io::stderr(), "warning: {err}").ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
