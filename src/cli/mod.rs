//! Command-line interface definitions for the `kiso` binary.
//!
//! The parser structures live here so the build script can reuse them when
//! generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `kiso` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiso",
    about = "Provision testbeds, install software, and run experiments from one document",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Increase log verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Lifecycle command to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Lifecycle commands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Validate the experiment document without touching any machine.
    #[command(name = "check")]
    Check(CheckCommand),
    /// Provision sites, then install software and deployments.
    #[command(name = "up")]
    Up(UpCommand),
    /// Run every experiment and collect its outputs.
    #[command(name = "run")]
    Run(RunCommand),
    /// Tear every provisioned site down.
    #[command(name = "down")]
    Down(DownCommand),
}

/// Experiment document argument shared by every command.
#[derive(Debug, Args)]
pub(crate) struct DocumentArg {
    /// Experiment document.
    #[arg(value_name = "CONFIG", default_value = "experiment.yml")]
    pub(crate) config: PathBuf,
}

/// Output directory holding the state file and results.
#[derive(Debug, Args)]
pub(crate) struct OutputArg {
    /// Directory holding `kiso-state.json`, the host map, and results.
    #[arg(short, long, value_name = "DIR", default_value = "output")]
    pub(crate) output: PathBuf,
}

/// Arguments for `kiso check`.
#[derive(Debug, Args)]
pub(crate) struct CheckCommand {
    #[command(flatten)]
    pub(crate) document: DocumentArg,
}

/// Arguments for `kiso up`.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    #[command(flatten)]
    pub(crate) document: DocumentArg,
    #[command(flatten)]
    pub(crate) output: OutputArg,
    /// Discard previous state and provision from scratch.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `kiso run`.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    #[command(flatten)]
    pub(crate) document: DocumentArg,
    #[command(flatten)]
    pub(crate) output: OutputArg,
    /// Copy the working directory again and re-run completed iterations.
    #[arg(long)]
    pub(crate) force: bool,
    /// Record a failing experiment and continue with the next one.
    #[arg(long)]
    pub(crate) keep_going: bool,
}

/// Arguments for `kiso down`.
#[derive(Debug, Args)]
pub(crate) struct DownCommand {
    #[command(flatten)]
    pub(crate) document: DocumentArg,
    #[command(flatten)]
    pub(crate) output: OutputArg,
}
