//! Per-invocation session context and run directory layout.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Files under the run directory (`<working_dir>/.runner` by default)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn transcript(&self) -> PathBuf {
        self.root.join("output.log")
    }

    pub fn transcript_index(&self) -> PathBuf {
        self.root.join("output.index.jsonl")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("runner.pid")
    }

    pub fn input_pipe(&self) -> PathBuf {
        self.root.join("input.pipe")
    }

    pub fn briefing(&self) -> PathBuf {
        self.root.join("briefing.md")
    }

    /// Create the run directory and remove a previous run's files.
    ///
    /// Only the files named here are touched; anything else in the directory
    /// is left alone.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        for path in [
            self.status_file(),
            self.transcript(),
            self.transcript_index(),
            self.pid_file(),
            self.input_pipe(),
            self.briefing(),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Record our own pid for external liveness checks
    pub fn write_pid(&self, pid: u32) -> std::io::Result<()> {
        std::fs::write(self.pid_file(), pid.to_string())
    }
}

/// Everything the components need to know about this invocation.
///
/// Created once by the CLI and handed to the store, trigger and supervisor
/// explicitly instead of living in ambient global state.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub label: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub layout: RunLayout,
    pub runner_pid: u32,
    pub child_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(label: &str, command: &str, working_dir: &Path, layout: RunLayout) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            label: label.to_string(),
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            layout,
            runner_pid: std::process::id(),
            child_pid: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_child_pid(mut self, pid: Option<u32>) -> Self {
        self.child_pid = pid;
        self
    }
}
