use anyhow::Context;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Configuration for spawning a PTY session
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

impl PtyConfig {
    /// Run `command_line` through `/bin/sh -c`, the way a user would type it
    pub fn shell(command_line: &str) -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), command_line.to_string()],
            ..Default::default()
        }
    }
}

/// Snapshot of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

/// A chunk of combined stdout/stderr read from the PTY master
#[derive(Clone, Debug)]
pub struct PtyOutput {
    pub data: Vec<u8>,
    /// Wall-clock read time, milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// How the child process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildExit {
    pub code: i32,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Cloneable handle to the session actor; the only path to the PTY input side
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Write raw bytes to the child's input
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::SessionClosed)?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive write response".into()))?
    }

    /// Get the current state of the session
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::SessionClosed)?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive state response".into()))
    }

    /// Signal the child. `None` means SIGTERM to the whole process group.
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::SessionClosed)?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive kill response".into()))?
    }
}

/// One child process attached to the slave side of a freshly allocated PTY.
///
/// Output is read by a dedicated blocking thread and delivered in order; the
/// child's exit is observed by a second thread. Writes, kills and state
/// queries go through a tokio actor so there is exactly one writer.
pub struct PtySession {
    handle: PtyHandle,
    output: mpsc::UnboundedReceiver<PtyOutput>,
    exit: oneshot::Receiver<ChildExit>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession").field("pid", &self.pid).finish()
    }
}

impl PtySession {
    /// Allocate a PTY and spawn the configured program on it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PtyConfig) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir.display());
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for key in ["PATH", "HOME", "USER"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::LaunchFailed(e.to_string())
        })?;
        // The slave must not stay open in this process, or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        let running = Arc::new(AtomicBool::new(true));
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (msg_tx, msg_rx) = mpsc::channel(32);

        spawn_reader(reader, output_tx);
        spawn_waiter(child, exit_tx, running.clone());

        let actor = PtyActor {
            _master: pair.master,
            writer,
            killer,
            running,
            state: PtyState {
                running: true,
                pid,
                command: config.command.clone(),
                args: config.args.clone(),
                rows: config.rows,
                cols: config.cols,
            },
            receiver: msg_rx,
        };

        tokio::spawn(actor.run());

        Ok(Self {
            handle: PtyHandle { sender: msg_tx },
            output: output_rx,
            exit: exit_rx,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn handle(&self) -> PtyHandle {
        self.handle.clone()
    }

    /// Next chunk of output, or `None` once the PTY has closed
    pub async fn read_chunk(&mut self) -> Option<PtyOutput> {
        self.output.recv().await
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<ChildExit, PtyError> {
        (&mut self.exit)
            .await
            .map_err(|_| PtyError::ChannelError("Child waiter went away".into()))
    }

    /// Split into independently driven parts: input handle, output stream, exit signal
    pub fn into_parts(
        self,
    ) -> (
        PtyHandle,
        mpsc::UnboundedReceiver<PtyOutput>,
        oneshot::Receiver<ChildExit>,
    ) {
        (self.handle, self.output, self.exit)
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, output_tx: mpsc::UnboundedSender<PtyOutput>) {
    std::thread::spawn(move || {
        let mut buffer = vec![0u8; 10240];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY EOF detected");
                    break;
                }
                Ok(n) => {
                    let output = PtyOutput {
                        data: buffer[..n].to_vec(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if output_tx.send(output).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) => {
                    debug!("PTY closed: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("Error reading PTY output: {}", e);
                    break;
                }
            }
        }
        debug!("PTY reader thread exiting");
    });
}

fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: oneshot::Sender<ChildExit>,
    running: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let exit = match child.wait() {
            Ok(status) => {
                info!("PTY process exited with status: {:?}", status);
                ChildExit {
                    code: i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                }
            }
            Err(e) => {
                warn!("Failed to wait for PTY process: {}", e);
                ChildExit { code: -1 }
            }
        };
        running.store(false, Ordering::SeqCst);
        let _ = exit_tx.send(exit);
    });
}

/// Linux reports EIO on the master once every slave descriptor is closed.
fn is_hangup(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

struct PtyActor {
    // Held so the master side stays open for the session's lifetime.
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    running: Arc<AtomicBool>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    async fn run(mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.state.command, self.state.pid
        );

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let result = self.handle_write_input(&data);
                    let _ = respond_to.send(result);
                }
                PtyMessage::GetState { respond_to } => {
                    self.state.running = self.running.load(Ordering::SeqCst);
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { signal, respond_to } => {
                    let result = self.handle_kill(signal.as_deref());
                    let _ = respond_to.send(result);
                }
            }
        }

        debug!("PTY actor shutting down");
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PtyError::SessionClosed);
        }

        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn handle_kill(&mut self, signal: Option<&str>) -> Result<(), PtyError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        match signal {
            Some("SIGTERM") | None => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill, killpg};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        let pid = Pid::from_raw(pid as i32);
                        // portable-pty makes the child a session leader, so its pid is the group id
                        if killpg(pid, Signal::SIGTERM).is_err() {
                            kill(pid, Signal::SIGTERM)
                                .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    self.killer
                        .kill()
                        .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                }
            }
            Some("SIGKILL") => {
                self.killer
                    .kill()
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
            }
            Some("SIGINT") => {
                self.handle_write_input(b"\x03")?;
            }
            Some(sig) => {
                return Err(PtyError::KillFailed(format!("Unsupported signal: {}", sig)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_output(session: &mut PtySession) -> String {
        let mut out = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(10), session.read_chunk()).await
        {
            out.extend_from_slice(&chunk.data);
        }
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let mut session = PtySession::start(PtyConfig::shell("printf hello; exit 3")).unwrap();
        assert!(session.pid().is_some());

        let output = collect_output(&mut session).await;
        assert!(output.contains("hello"), "unexpected output: {output:?}");

        let exit = session.wait().await.unwrap();
        assert_eq!(exit.code, 3);
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let mut session = PtySession::start(PtyConfig::shell("read line; echo got:$line")).unwrap();
        let handle = session.handle();

        let written = handle.write(b"marker\n").await.unwrap();
        assert_eq!(written, 7);

        let output = collect_output(&mut session).await;
        assert!(output.contains("got:marker"), "unexpected output: {output:?}");
        assert!(session.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_rejected() {
        let mut session = PtySession::start(PtyConfig::shell("exit 0")).unwrap();
        let handle = session.handle();
        session.wait().await.unwrap();

        let err = handle.write(b"late\n").await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let config = PtyConfig {
            command: "/definitely/not/a/real/program".to_string(),
            ..Default::default()
        };
        let err = PtySession::start(config).unwrap_err();
        assert!(matches!(err, PtyError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_kill_terminates_child() {
        let mut session = PtySession::start(PtyConfig::shell("sleep 30")).unwrap();
        let handle = session.handle();
        assert!(handle.state().await.unwrap().running);

        handle.kill(None).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());
    }
}
