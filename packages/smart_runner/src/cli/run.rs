//! `smart-runner run`: launch the child and supervise it to completion.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pty_session::{PtyConfig, PtyHandle, PtySession};

use super::RunArgs;
use crate::capture::{OutputCapture, Transcript};
use crate::config::RunnerConfig;
use crate::context::{RunLayout, SessionContext};
use crate::error::LaunchError;
use crate::input::{self, FifoSource};
use crate::status::{StatusStore, StatusUpdate};
use crate::supervisor::{Outcome, SessionIo, Supervisor};
use crate::trigger::{self, CommandTrigger, NoopTrigger, Trigger};

/// Everything a launched run needs; dropping it releases the pipe
struct Launched {
    session: PtySession,
    context: SessionContext,
    store: Arc<StatusStore>,
    capture: OutputCapture,
    input: input::InputQueue,
    fifo: FifoSource,
    fifo_cancel: CancellationToken,
}

/// Run to completion and return the process exit code
pub async fn run_command(args: RunArgs) -> Result<u8> {
    let (working_dir, config) = args.location.resolve()?;
    info!("Starting smart-runner for: {}", args.cmd);

    let layout = RunLayout::new(config.run_dir.clone());
    let context = SessionContext::new(&args.name, &args.cmd, &working_dir, layout.clone());

    let launched = match launch(&args, &config, context) {
        Ok(launched) => launched,
        Err(e) => {
            error!("Launch failed: {}", e);
            record_launch_failure(&layout, &args, &working_dir, &e);
            return Ok(super::EXIT_LAUNCH_FAILURE);
        }
    };

    let outcome = supervise(launched, &args, &config).await;
    info!(
        pauses = outcome.pauses,
        "Done; child exit code {:?}", outcome.exit_code
    );
    Ok(exit_code(&outcome))
}

fn launch(
    args: &RunArgs,
    config: &RunnerConfig,
    context: SessionContext,
) -> Result<Launched, LaunchError> {
    let layout = context.layout.clone();

    layout.prepare().map_err(prepare_failed(layout.root()))?;
    layout
        .write_pid(context.runner_pid)
        .map_err(prepare_failed(&layout.pid_file()))?;

    let transcript = Transcript::create(&layout.transcript(), &layout.transcript_index())
        .map_err(prepare_failed(&layout.transcript()))?;

    let (sender, queue) = input::channel();
    let fifo_cancel = CancellationToken::new();
    let fifo = FifoSource::create(&layout.input_pipe(), sender, fifo_cancel.clone())
        .map_err(prepare_failed(&layout.input_pipe()))?;

    let pty_config = PtyConfig {
        working_dir: Some(context.working_dir.clone()),
        rows: config.rows,
        cols: config.cols,
        env: vec![
            ("SMART_RUNNER_LABEL".to_string(), args.name.clone()),
            (
                "SMART_RUNNER_RUN_DIR".to_string(),
                layout.root().display().to_string(),
            ),
        ],
        ..PtyConfig::shell(&args.cmd)
    };
    let session = PtySession::start(pty_config)?;
    let context = context.with_child_pid(session.pid());
    info!("Child started with pid {:?}", session.pid());

    let store = Arc::new(StatusStore::file(layout.status_file(), Some(context.clone())));
    let mut capture = OutputCapture::new(transcript, Arc::clone(&store));
    if config.echo && !args.headless {
        capture = capture.with_echo(Box::new(std::io::stdout()));
    }

    Ok(Launched {
        session,
        context,
        store,
        capture,
        input: queue,
        fifo,
        fifo_cancel,
    })
}

fn prepare_failed(path: &Path) -> impl FnOnce(std::io::Error) -> LaunchError {
    let path = path.to_path_buf();
    move |source| LaunchError::Prepare { path, source }
}

async fn supervise(launched: Launched, args: &RunArgs, config: &RunnerConfig) -> Outcome {
    let Launched {
        session,
        context,
        store,
        capture,
        input,
        fifo,
        fifo_cancel,
    } = launched;

    let briefing = trigger::briefing(&context, &args.payload);
    if let Err(e) = std::fs::write(context.layout.briefing(), &briefing) {
        warn!("Failed to write operator briefing: {}", e);
    }
    let trigger: Arc<dyn Trigger> = match &config.trigger_command {
        Some(command) => Arc::new(CommandTrigger::new(
            command,
            config.trigger_timeout,
            &context,
            briefing,
        )),
        None => Arc::new(NoopTrigger),
    };

    let (handle, output, exit) = session.into_parts();
    let signals = tokio::spawn(forward_signals(handle.clone()));

    let supervisor = Supervisor::new(config, store, trigger);
    let outcome = supervisor
        .run(
            SessionIo {
                output,
                exit,
                sink: handle,
            },
            capture,
            input,
        )
        .await;

    signals.abort();
    fifo_cancel.cancel();
    drop(fifo);
    outcome
}

/// SIGINT/SIGTERM stop the child's process group; a second signal kills it.
async fn forward_signals(handle: PtyHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

    let mut received = 0;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        received += 1;
        let kind = if received == 1 { None } else { Some("SIGKILL") };
        info!("Received shutdown signal, stopping child ({})", kind.unwrap_or("SIGTERM"));
        if let Err(e) = handle.kill(kind).await {
            warn!("Failed to signal child: {}", e);
        }
    }
}

/// Leave a terminal record behind so an observer can see why nothing ran
fn record_launch_failure(
    layout: &RunLayout,
    args: &RunArgs,
    working_dir: &Path,
    err: &LaunchError,
) {
    if let Err(e) = std::fs::create_dir_all(layout.root()) {
        warn!("Cannot record launch failure in {}: {}", layout.root().display(), e);
        return;
    }
    let context = SessionContext::new(&args.name, &args.cmd, working_dir, layout.clone());
    let store = StatusStore::file(layout.status_file(), Some(context));
    if let Err(e) = store.publish(StatusUpdate::exited(None, format!("Launch failed: {err}"))) {
        warn!("Cannot record launch failure: {}", e);
    }
}

fn exit_code(outcome: &Outcome) -> u8 {
    match outcome.exit_code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}
