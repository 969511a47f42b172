//! End to end: a real child in a real PTY, with an operator that answers a
//! prompt through the input pipe and acknowledges the pause.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use pty_session::{PtyConfig, PtySession};
use smart_runner::cli::operator;
use smart_runner::config::{FileConfig, RunnerConfig};
use smart_runner::input::{self, FifoSource};
use smart_runner::{
    NoopTrigger, OutputCapture, PauseReason, RunLayout, RunState, SessionContext, SessionIo,
    StatusStore, Supervisor, Transcript,
};

fn fast_config(working_dir: &std::path::Path) -> RunnerConfig {
    let mut config = RunnerConfig::from_file(&FileConfig::default(), working_dir).unwrap();
    config.timing.io_wait = Duration::from_millis(300);
    config.timing.stall = Duration::from_secs(5);
    config.ack_poll = Duration::from_millis(50);
    config.echo = false;
    config
}

async fn wait_for<F: Fn(&smart_runner::StatusRecord) -> bool>(
    layout: &RunLayout,
    what: &str,
    pred: F,
) -> smart_runner::StatusRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(record) = operator::read_status(layout) {
            if pred(&record) {
                return record;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_operator_answers_prompt_and_child_exit_code_is_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fast_config(tmp.path());
    let layout = RunLayout::new(config.run_dir.clone());
    layout.prepare().unwrap();

    let (sender, queue) = input::channel();
    let fifo_cancel = CancellationToken::new();
    let fifo = FifoSource::create(&layout.input_pipe(), sender, fifo_cancel.clone()).unwrap();

    let script = "printf 'Proceed? [y/N]: '; read answer; echo \"got $answer\"; exit 3";
    let session = PtySession::start(PtyConfig {
        working_dir: Some(tmp.path().to_path_buf()),
        ..PtyConfig::shell(script)
    })
    .unwrap();

    let context = SessionContext::new("e2e", script, tmp.path(), layout.clone())
        .with_child_pid(session.pid());
    let store = Arc::new(StatusStore::file(layout.status_file(), Some(context)));
    let transcript = Transcript::create(&layout.transcript(), &layout.transcript_index()).unwrap();
    let capture = OutputCapture::new(transcript, Arc::clone(&store));

    let (handle, output, exit) = session.into_parts();
    let supervisor = Supervisor::new(&config, store, Arc::new(NoopTrigger));
    let run = tokio::spawn(supervisor.run(
        SessionIo {
            output,
            exit,
            sink: handle,
        },
        capture,
        queue,
    ));

    let paused = wait_for(&layout, "IO_WAIT", |r| r.state == RunState::WaitingForAi).await;
    assert_eq!(paused.reason, Some(PauseReason::IoWait));
    assert!(paused.child_pid.is_some());

    operator::acknowledge(&layout, Some(paused.sequence)).unwrap();
    wait_for(&layout, "resume", |r| r.state == RunState::Monitoring).await;
    operator::send_input(&layout, b"y\n").unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor did not finish")
        .unwrap();
    assert_eq!(outcome.exit_code, Some(3));

    let last = operator::read_status(&layout).unwrap();
    assert_eq!(last.state, RunState::Exited);
    assert_eq!(last.exit_code, Some(3));

    let transcript = String::from_utf8_lossy(&Transcript::read_all(&layout.transcript()).unwrap())
        .into_owned();
    assert!(transcript.contains("Proceed? [y/N]: "), "{transcript}");
    assert!(transcript.contains("got y"), "{transcript}");

    let index = Transcript::read_index(&layout.transcript_index()).unwrap();
    assert!(index.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
    assert_eq!(
        index.iter().map(|e| e.len).sum::<u64>(),
        Transcript::read_all(&layout.transcript()).unwrap().len() as u64
    );

    fifo_cancel.cancel();
    drop(fifo);
    assert!(!layout.input_pipe().exists());
}
