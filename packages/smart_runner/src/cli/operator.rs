//! Operator-side helpers: inspect status, acknowledge a pause, send input.
//!
//! These run in a separate process from the supervisor and talk to it only
//! through the run directory.

use anyhow::{Context, Result, bail};
use std::io::Write;

use super::{AckArgs, SendArgs, StatusArgs};
use crate::context::RunLayout;
use crate::error::StoreError;
use crate::status::{StatusRecord, StatusStore};
use crate::timing::RunState;

pub fn status_command(args: StatusArgs) -> Result<()> {
    let record = read_status(&args.location.layout()?)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub fn ack_command(args: AckArgs) -> Result<()> {
    let record = acknowledge(&args.location.layout()?, args.sequence)?;
    println!("Acknowledged; status is now {} at sequence {}", record.state, record.sequence);
    Ok(())
}

pub fn send_command(args: SendArgs) -> Result<()> {
    let mut data = args.text.into_bytes();
    if args.newline {
        data.push(b'\n');
    }
    let n = send_input(&args.location.layout()?, &data)?;
    println!("Sent {n} bytes");
    Ok(())
}

pub fn read_status(layout: &RunLayout) -> Result<StatusRecord> {
    let path = layout.status_file();
    if !path.exists() {
        bail!("no status at {}; is a runner active here?", path.display());
    }
    StatusStore::file(&path, None)
        .read()
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Acknowledge the pause at `sequence`, or the current pause when `None`
pub fn acknowledge(layout: &RunLayout, sequence: Option<u64>) -> Result<StatusRecord> {
    let store = StatusStore::file(layout.status_file(), None);
    let token = match sequence {
        Some(token) => token,
        None => {
            let current = read_status(layout)?;
            if current.state != RunState::WaitingForAi {
                bail!(
                    "nothing to acknowledge: status is {} at sequence {}",
                    current.state,
                    current.sequence
                );
            }
            current.sequence
        }
    };

    match store.acknowledge(token) {
        Ok(record) => Ok(record),
        Err(e @ StoreError::Conflict { .. }) => {
            Err(e).context("status changed since it was read; check it again before acknowledging")
        }
        Err(e) => Err(e).context("Failed to write status"),
    }
}

/// Write bytes into the runner's input pipe without blocking
pub fn send_input(layout: &RunLayout, data: &[u8]) -> Result<usize> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = layout.input_pipe();
    // O_NONBLOCK turns "no reader" into ENXIO instead of hanging.
    let mut pipe = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(&path)
        .with_context(|| format!("No runner is reading {}", path.display()))?;
    pipe.write_all(data)
        .with_context(|| format!("Failed to write to {}", path.display()))?;
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{self, FifoSource};
    use crate::status::StatusUpdate;
    use crate::timing::PauseReason;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn layout() -> (tempfile::TempDir, RunLayout) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path().join(".runner"));
        layout.prepare().unwrap();
        (tmp, layout)
    }

    #[test]
    fn test_status_without_runner_is_an_error() {
        let (_tmp, layout) = layout();
        let err = read_status(&layout).unwrap_err();
        assert!(err.to_string().contains("no status"));
    }

    #[test]
    fn test_ack_current_pause() {
        let (_tmp, layout) = layout();
        let supervisor = StatusStore::file(layout.status_file(), None);
        let paused = supervisor.publish(StatusUpdate::waiting(PauseReason::IoWait)).unwrap();

        let record = acknowledge(&layout, None).unwrap();
        assert_eq!(record.state, RunState::AiDone);
        assert_eq!(record.sequence, paused.sequence + 1);
    }

    #[test]
    fn test_ack_refuses_when_not_paused() {
        let (_tmp, layout) = layout();
        StatusStore::file(layout.status_file(), None)
            .publish(StatusUpdate::monitoring("running"))
            .unwrap();

        let err = acknowledge(&layout, None).unwrap_err();
        assert!(err.to_string().contains("nothing to acknowledge"));
    }

    #[test]
    fn test_ack_with_stale_sequence_is_a_conflict() {
        let (_tmp, layout) = layout();
        let supervisor = StatusStore::file(layout.status_file(), None);
        let first = supervisor.publish(StatusUpdate::waiting(PauseReason::Stall)).unwrap();
        supervisor.publish(StatusUpdate::waiting(PauseReason::Stall)).unwrap();

        let err = acknowledge(&layout, Some(first.sequence)).unwrap_err();
        let conflict = err.downcast_ref::<StoreError>().unwrap();
        assert!(conflict.is_conflict());
        assert_eq!(read_status(&layout).unwrap().state, RunState::WaitingForAi);
    }

    #[test]
    fn test_send_without_runner_fails_fast() {
        let (_tmp, layout) = layout();
        nix::unistd::mkfifo(
            &layout.input_pipe(),
            nix::sys::stat::Mode::from_bits_truncate(0o600),
        )
        .unwrap();

        assert!(send_input(&layout, b"hello\n").is_err());
    }

    #[tokio::test]
    async fn test_send_reaches_runner_queue() {
        let (_tmp, layout) = layout();
        let (sender, mut queue) = input::channel();
        let _fifo = FifoSource::create(&layout.input_pipe(), sender, CancellationToken::new()).unwrap();

        assert_eq!(send_input(&layout, b"y\n").unwrap(), 2);
        let got = tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"y\n");
    }
}
