//! External trigger hook: tells whoever plays operator that something happened.
//!
//! The core never waits on the operator here. A trigger only announces an
//! event; the pause itself is resolved through the status store.

use anyhow::Context;
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::timing::PauseReason;

/// What the operator is being told about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerEvent {
    Started,
    Paused { reason: PauseReason, sequence: u64 },
    Exited { exit_code: Option<i32> },
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::Started => "started",
            TriggerEvent::Paused { .. } => "paused",
            TriggerEvent::Exited { .. } => "exited",
        }
    }
}

pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Delivery of [`TriggerEvent`]s.
///
/// `notify` returns a self-contained future; callers spawn it for events that
/// must not hold up supervision and await it for the final one.
pub trait Trigger: Send + Sync {
    fn notify(&self, event: TriggerEvent) -> TriggerFuture;
}

/// Used when no trigger command is configured
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTrigger;

impl Trigger for NoopTrigger {
    fn notify(&self, event: TriggerEvent) -> TriggerFuture {
        debug!(event = event.name(), "No trigger configured");
        Box::pin(async {})
    }
}

/// Runs a shell command per event, briefing on stdin and event details in env
#[derive(Clone, Debug)]
pub struct CommandTrigger {
    inner: Arc<CommandTriggerInner>,
}

#[derive(Debug)]
struct CommandTriggerInner {
    command: String,
    timeout: Duration,
    briefing: String,
    context: SessionContext,
}

impl CommandTrigger {
    pub fn new(command: &str, timeout: Duration, context: &SessionContext, briefing: String) -> Self {
        Self {
            inner: Arc::new(CommandTriggerInner {
                command: command.to_string(),
                timeout,
                briefing,
                context: context.clone(),
            }),
        }
    }

    /// Run the command for one event and wait for it, up to the timeout
    ///
    /// # Errors
    ///
    /// Fails if the command cannot be spawned, exits non-zero, or times out.
    pub async fn run(&self, event: &TriggerEvent) -> anyhow::Result<()> {
        let inner = &self.inner;
        let ctx = &inner.context;

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&inner.command)
            .current_dir(&ctx.working_dir)
            .env("SMART_RUNNER_EVENT", event.name())
            .env("SMART_RUNNER_LABEL", &ctx.label)
            .env("SMART_RUNNER_SESSION_ID", ctx.session_id.to_string())
            .env("SMART_RUNNER_STATUS_FILE", ctx.layout.status_file())
            .env("SMART_RUNNER_RUN_DIR", ctx.layout.root())
            .env("SMART_RUNNER_INPUT_PIPE", ctx.layout.input_pipe())
            .env("SMART_RUNNER_TRANSCRIPT", ctx.layout.transcript())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(pid) = ctx.child_pid {
            cmd.env("SMART_RUNNER_CHILD_PID", pid.to_string());
        }
        match event {
            TriggerEvent::Started => {}
            TriggerEvent::Paused { reason, sequence } => {
                cmd.env("SMART_RUNNER_REASON", reason.as_str())
                    .env("SMART_RUNNER_SEQUENCE", sequence.to_string());
            }
            TriggerEvent::Exited { exit_code } => {
                if let Some(code) = exit_code {
                    cmd.env("SMART_RUNNER_EXIT_CODE", code.to_string());
                }
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn trigger command `{}`", inner.command))?;

        // Feed stdin concurrently so a chatty command cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            let briefing = inner.briefing.clone().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&briefing).await {
                    debug!("Trigger command did not read the briefing: {}", e);
                }
            });
        }

        let output = tokio::time::timeout(inner.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("trigger command timed out after {:?}", inner.timeout))?
            .context("failed to wait for trigger command")?;

        if !output.stdout.is_empty() {
            debug!(
                "Trigger stdout: {}",
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
        }
        if !output.status.success() {
            anyhow::bail!(
                "trigger command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        Ok(())
    }
}

impl Trigger for CommandTrigger {
    fn notify(&self, event: TriggerEvent) -> TriggerFuture {
        let this = self.clone();
        Box::pin(async move {
            info!(event = event.name(), "Firing trigger command");
            if let Err(e) = this.run(&event).await {
                warn!(event = event.name(), "Trigger failed: {:#}", e);
            }
        })
    }
}

/// The operator briefing: task payload, process info, and how to respond
pub fn briefing(ctx: &SessionContext, payload: &str) -> String {
    let layout = &ctx.layout;
    let dir = ctx.working_dir.display();
    let mut out = String::new();

    let _ = writeln!(out, "# {}\n", ctx.label);
    let _ = writeln!(out, "{}\n", payload.trim_end());

    let _ = writeln!(out, "## Process\n");
    let _ = writeln!(out, "- Command: `{}`", ctx.command);
    match ctx.child_pid {
        Some(pid) => {
            let _ = writeln!(out, "- Child PID: {pid}");
        }
        None => {
            let _ = writeln!(out, "- Child PID: unknown");
        }
    }
    let _ = writeln!(out, "- Runner PID: {}", ctx.runner_pid);
    let _ = writeln!(out, "- Working dir: {dir}");
    let _ = writeln!(out, "- Run dir: {}", layout.root().display());
    let _ = writeln!(out, "- Input pipe: {}", layout.input_pipe().display());
    let _ = writeln!(out, "- Session: {}\n", ctx.session_id);

    let _ = writeln!(out, "## Instructions\n");
    let _ = writeln!(
        out,
        "1. Check status: `smart-runner status --dir {dir}` (or read {}).",
        layout.status_file().display()
    );
    let _ = writeln!(out, "   - MONITORING: heartbeat only, report progress if needed.");
    let _ = writeln!(out, "   - WAITING_FOR_AI: action required. Note the `sequence`.");
    let _ = writeln!(
        out,
        "2. Analyze: read the last ~30 lines of {}.",
        layout.transcript().display()
    );
    let _ = writeln!(out, "3. Intervene if needed:");
    let _ = writeln!(
        out,
        "   - Send a line: `smart-runner send --dir {dir} --newline \"your input\"`"
    );
    let _ = writeln!(
        out,
        "   - Raw bytes: `printf '\\x03' > {}` (Ctrl+C)",
        layout.input_pipe().display()
    );
    let _ = writeln!(out, "4. Resume (required, the runner stays paused otherwise):");
    let _ = writeln!(
        out,
        "   `smart-runner ack --dir {dir} --sequence <sequence>`, or write"
    );
    let _ = writeln!(
        out,
        "   {{\"state\": \"AI_DONE\", \"sequence\": <sequence + 1>}} to {}",
        layout.status_file().display()
    );
    out
}
