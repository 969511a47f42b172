//! Operator input: a non-blocking FIFO drop point and the PTY sink it drains into.

use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pty_session::{PtyError, PtyHandle};

/// The single writer path into the child's input
pub trait InputSink: Send + Sync + 'static {
    fn write_input(&self, data: Vec<u8>) -> impl Future<Output = Result<usize, PtyError>> + Send;
}

impl InputSink for PtyHandle {
    async fn write_input(&self, data: Vec<u8>) -> Result<usize, PtyError> {
        self.write(&data).await
    }
}

/// Create a connected sender/queue pair
pub fn channel() -> (InputSender, InputQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InputSender { tx }, InputQueue { rx })
}

/// Cloneable drop point; `send` never waits on the supervisor
#[derive(Clone, Debug)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl InputSender {
    /// Queue raw bytes for the child. Returns false once the session is gone.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        let data = data.into();
        if data.is_empty() {
            return true;
        }
        self.tx.send(data).is_ok()
    }
}

/// Pending input, delivered strictly in submission order
#[derive(Debug)]
pub struct InputQueue {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl InputQueue {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Drop everything still queued, returning how many entries were discarded
    pub fn discard_pending(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Relays bytes written to a named pipe into an [`InputSender`].
///
/// The pipe is removed when the source is dropped.
#[cfg(unix)]
#[derive(Debug)]
pub struct FifoSource {
    path: PathBuf,
    task: JoinHandle<()>,
}

#[cfg(unix)]
impl FifoSource {
    /// Create the pipe at `path` (mode 0660) and start relaying.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(
        path: &Path,
        sender: InputSender,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        use nix::sys::stat::Mode;
        use std::os::unix::fs::PermissionsExt;

        nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o660)).map_err(std::io::Error::from)?;
        // mkfifo is subject to the umask
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;

        let receiver = open_receiver(path).inspect_err(|_| {
            let _ = std::fs::remove_file(path);
        })?;
        info!("Input pipe ready at {}", path.display());

        let task = tokio::spawn(relay(receiver, sender, cancel));
        Ok(Self {
            path: path.to_path_buf(),
            task,
        })
    }
}

#[cfg(unix)]
impl Drop for FifoSource {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove input pipe {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(unix)]
fn open_receiver(path: &Path) -> std::io::Result<tokio::net::unix::pipe::Receiver> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    // Holding our own write end means writers can come and go without EOF.
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

#[cfg(unix)]
async fn relay(
    mut receiver: tokio::net::unix::pipe::Receiver,
    sender: InputSender,
    cancel: CancellationToken,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = receiver.read(&mut buf) => match read {
                Ok(0) => {
                    // No writer attached (platforms without read-write FIFOs)
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Ok(n) => {
                    debug!("Input pipe relayed {} bytes", n);
                    if !sender.send(&buf[..n]) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Input pipe read failed: {}", e);
                    break;
                }
            },
        }
    }
    debug!("Input pipe relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_preserves_submission_order() {
        let (sender, mut queue) = channel();
        for marker in ["MARK-1\n", "MARK-2\n", "\x03", "MARK-3\n"] {
            assert!(sender.send(marker));
        }

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(queue.recv().await.unwrap());
        }
        assert_eq!(
            got,
            vec![
                b"MARK-1\n".to_vec(),
                b"MARK-2\n".to_vec(),
                b"\x03".to_vec(),
                b"MARK-3\n".to_vec()
            ]
        );
    }

    #[test]
    fn test_send_never_waits_on_the_consumer() {
        let (sender, mut queue) = channel();
        let mut recv = tokio_test::task::spawn(queue.recv());
        tokio_test::assert_pending!(recv.poll());

        assert!(sender.send("late\n"));
        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), Some(b"late\n".to_vec()));
    }

    #[tokio::test]
    async fn test_discard_pending_closes_queue() {
        let (sender, mut queue) = channel();
        sender.send("a");
        sender.send("b");

        assert_eq!(queue.discard_pending(), 2);
        assert!(!sender.send("c"));
        assert!(queue.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_relays_bytes_across_writers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("input.pipe");
        let (sender, mut queue) = channel();
        let cancel = CancellationToken::new();

        let source = FifoSource::create(&path, sender, cancel.clone()).unwrap();

        for payload in [&b"yes\n"[..], &b"\x1b[A"[..]] {
            let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            writer.write_all(payload).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 7 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), queue.recv())
                .await
                .expect("timed out waiting for pipe input")
                .unwrap();
            received.extend(chunk);
        }
        assert_eq!(received, b"yes\n\x1b[A");

        drop(source);
        assert!(!path.exists());
    }
}
