use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::timing::{PromptHeuristic, TimingPolicy};

// =============================================================================
// Unified config (figment-deserialized from defaults / smart-runner.toml / env)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   smart-runner.toml:  [timing]
//                       stall_secs = 60
//
//   env var:            SMART_RUNNER_TIMING__STALL_SECS=60   (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "smart-runner.toml";
pub const ENV_PREFIX: &str = "SMART_RUNNER_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub timing: TimingFileConfig,
    #[serde(default)]
    pub runner: RunnerFileConfig,
    #[serde(default)]
    pub trigger: TriggerFileConfig,
}

/// Pause heuristics (lives under `[timing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingFileConfig {
    #[serde(default = "default_io_wait_secs")]
    pub io_wait_secs: f64,
    #[serde(default = "default_stall_secs")]
    pub stall_secs: f64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f64,
    /// Any of these characters at the end of a chunk marks it as a completed line.
    /// Empty disables IO_WAIT detection.
    #[serde(default = "default_prompt_terminators")]
    pub prompt_terminators: String,
}

impl Default for TimingFileConfig {
    fn default() -> Self {
        Self {
            io_wait_secs: default_io_wait_secs(),
            stall_secs: default_stall_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            prompt_terminators: default_prompt_terminators(),
        }
    }
}

/// Process and run-directory knobs (lives under `[runner]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerFileConfig {
    /// Run directory, relative to the working directory
    #[serde(default = "default_run_dir")]
    pub dir: String,
    /// Mirror child output to our own stdout
    #[serde(default = "default_echo")]
    pub echo: bool,
    #[serde(default = "default_ack_poll_ms")]
    pub ack_poll_ms: u64,
    /// How long to keep draining output after the child exits
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for RunnerFileConfig {
    fn default() -> Self {
        Self {
            dir: default_run_dir(),
            echo: default_echo(),
            ack_poll_ms: default_ack_poll_ms(),
            exit_grace_ms: default_exit_grace_ms(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// External trigger hook (lives under `[trigger]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerFileConfig {
    /// Shell command run on start, every pause, and exit. Unset disables triggering.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_trigger_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TriggerFileConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_trigger_timeout_secs(),
        }
    }
}

fn default_io_wait_secs() -> f64 {
    2.0
}
fn default_stall_secs() -> f64 {
    30.0
}
fn default_heartbeat_secs() -> f64 {
    300.0
}
fn default_prompt_terminators() -> String {
    "\n".to_string()
}
fn default_run_dir() -> String {
    ".runner".to_string()
}
fn default_echo() -> bool {
    true
}
fn default_ack_poll_ms() -> u64 {
    500
}
fn default_exit_grace_ms() -> u64 {
    500
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_trigger_timeout_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config file → SMART_RUNNER_* env vars.
///
/// With no explicit path, `smart-runner.toml` in the working directory is used
/// if present. Env vars use double-underscore for nesting into sections:
///   `SMART_RUNNER_TIMING__STALL_SECS=60`  →  `timing.stall_secs = 60`
pub fn load_config(working_dir: &Path, explicit: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| working_dir.join(CONFIG_FILE_NAME));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the runner)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub timing: TimingPolicy,
    pub run_dir: PathBuf,
    pub echo: bool,
    pub ack_poll: Duration,
    pub exit_grace: Duration,
    pub rows: u16,
    pub cols: u16,
    pub trigger_command: Option<String>,
    pub trigger_timeout: Duration,
}

impl RunnerConfig {
    /// Resolve file-level settings against a working directory.
    ///
    /// # Errors
    ///
    /// Returns an error when a timing value is negative or not finite, or
    /// when `runner.dir` resolves to the working directory or one of its
    /// ancestors.
    pub fn from_file(fc: &FileConfig, working_dir: &Path) -> anyhow::Result<Self> {
        let secs = |name: &str, value: f64| {
            Duration::try_from_secs_f64(value)
                .map_err(|e| anyhow::anyhow!("invalid timing.{name} = {value}: {e}"))
        };

        let timing = TimingPolicy {
            io_wait: secs("io_wait_secs", fc.timing.io_wait_secs)?,
            stall: secs("stall_secs", fc.timing.stall_secs)?,
            heartbeat: secs("heartbeat_secs", fc.timing.heartbeat_secs)?,
            prompt: if fc.timing.prompt_terminators.is_empty() {
                PromptHeuristic::Disabled
            } else {
                PromptHeuristic::TrailingTerminator {
                    terminators: fc.timing.prompt_terminators.clone(),
                }
            },
        };

        let run_dir = working_dir.join(&fc.runner.dir);
        let (work, run) = (normalize(working_dir)?, normalize(&run_dir)?);
        anyhow::ensure!(
            !work.starts_with(&run),
            "runner.dir = {:?} resolves to {}, which contains the working directory {}",
            fc.runner.dir,
            run.display(),
            work.display()
        );

        Ok(Self {
            timing,
            run_dir,
            echo: fc.runner.echo,
            ack_poll: Duration::from_millis(fc.runner.ack_poll_ms.max(1)),
            exit_grace: Duration::from_millis(fc.runner.exit_grace_ms),
            rows: fc.runner.rows,
            cols: fc.runner.cols,
            trigger_command: fc.trigger.command.clone().filter(|c| !c.trim().is_empty()),
            trigger_timeout: Duration::from_secs(fc.trigger.timeout_secs),
        })
    }
}

/// Absolute path with `.` and `..` resolved lexically
fn normalize(path: &Path) -> anyhow::Result<PathBuf> {
    use std::path::Component;

    let absolute = std::path::absolute(path)
        .map_err(|e| anyhow::anyhow!("cannot resolve {}: {e}", path.display()))?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
