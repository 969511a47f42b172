pub mod operator;
pub mod run;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{FileConfig, RunnerConfig, load_config};
use crate::context::RunLayout;

/// Exit code when the child could not be launched at all.
///
/// A child that itself exits with 125 is indistinguishable here; the
/// `EXITED` status record tells the two apart (`exit_code` is absent after a
/// launch failure).
pub const EXIT_LAUNCH_FAILURE: u8 = 125;

const RUN_EXIT_STATUS_HELP: &str = "\
Exit status:
  the child's exit code, or 1 if it does not fit in 0-255 or was lost
  125 if the child could not be launched; a child exiting with 125 looks the
      same, so check `smart-runner status`: exit_code is absent after a launch failure";

#[derive(Parser)]
#[command(name = "smart-runner")]
#[command(about = "Run a command in a PTY and pause for an operator on prompts, stalls and heartbeats")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run and supervise a command
    #[command(after_help = RUN_EXIT_STATUS_HELP)]
    Run(RunArgs),

    /// Print the current status record
    Status(StatusArgs),

    /// Acknowledge the current pause so monitoring resumes
    Ack(AckArgs),

    /// Send input to the supervised command
    Send(SendArgs),
}

/// Where to find the working directory and its config
#[derive(Args, Clone, Debug, Default)]
pub struct DirArgs {
    /// Working directory (defaults to the current directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Config file (defaults to smart-runner.toml in the working directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
pub struct RunArgs {
    /// Command line to run (through /bin/sh -c)
    #[arg(long)]
    pub cmd: String,

    /// Human-readable label for this run, passed to the trigger
    #[arg(long)]
    pub name: String,

    /// Task context for the operator briefing
    #[arg(long)]
    pub payload: String,

    #[command(flatten)]
    pub location: DirArgs,

    /// Don't mirror child output to stdout
    #[arg(long)]
    pub headless: bool,
}

#[derive(Parser)]
pub struct StatusArgs {
    #[command(flatten)]
    pub location: DirArgs,
}

#[derive(Parser)]
pub struct AckArgs {
    /// Sequence of the pause being acknowledged (default: the current one)
    #[arg(long)]
    pub sequence: Option<u64>,

    #[command(flatten)]
    pub location: DirArgs,
}

#[derive(Parser)]
pub struct SendArgs {
    /// Text to send, verbatim
    pub text: String,

    /// Append a newline
    #[arg(short, long)]
    pub newline: bool,

    #[command(flatten)]
    pub location: DirArgs,
}

impl DirArgs {
    /// Working directory and resolved config
    pub fn resolve(&self) -> Result<(PathBuf, RunnerConfig)> {
        let working_dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let config = resolve_config(&working_dir, self.config.as_deref())?;
        Ok((working_dir, config))
    }

    pub fn layout(&self) -> Result<RunLayout> {
        let (_, config) = self.resolve()?;
        Ok(RunLayout::new(config.run_dir))
    }
}

fn resolve_config(working_dir: &Path, explicit: Option<&Path>) -> Result<RunnerConfig> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.is_file(), "config file {} does not exist", path.display());
    }
    let file_config: FileConfig = load_config(working_dir, explicit)
        .extract()
        .context("Failed to load configuration")?;
    RunnerConfig::from_file(&file_config, working_dir)
}

/// Logging goes to stderr; stdout carries the child's output.
pub fn init_logging(debug: bool) {
    use tracing_subscriber::prelude::*;

    let default_directive = if debug {
        "smart_runner=debug,pty_session=debug,info"
    } else {
        "smart_runner=info,pty_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
