//! Supervisor: owns one session and drives the pause/resume protocol.
//!
//! Three tasks share a [`TimingEngine`] behind a mutex:
//! - output: capture each chunk, feed it to the engine, wake the timer
//! - input: deliver queued operator bytes to the PTY, one writer, FIFO
//! - timing: sleep until the nearest deadline; on expiry publish the pause
//!   and hold it until the operator acknowledges
//!
//! The child's exit ends everything: the engine goes terminal, input and
//! timing are cancelled, output is drained for a short grace period, and the
//! terminal status is published.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pty_session::{ChildExit, PtyOutput};

use crate::capture::OutputCapture;
use crate::config::RunnerConfig;
use crate::input::{InputQueue, InputSink};
use crate::status::{StatusRecord, StatusStore, StatusUpdate};
use crate::timing::{PauseReason, RunState, TimingEngine, TimingPolicy};
use crate::trigger::{Trigger, TriggerEvent};

/// The running child as the supervisor sees it
pub struct SessionIo<W> {
    pub output: mpsc::UnboundedReceiver<PtyOutput>,
    pub exit: oneshot::Receiver<ChildExit>,
    pub sink: W,
}

/// How a supervised run ended
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Child exit code; `None` if the exit could not be observed
    pub exit_code: Option<i32>,
    pub pauses: u64,
    /// Operator input still queued at exit
    pub discarded_input: usize,
    pub final_status: Option<StatusRecord>,
}

struct Shared {
    engine: Mutex<TimingEngine>,
    wake: Notify,
}

impl Shared {
    fn engine(&self) -> MutexGuard<'_, TimingEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Supervisor {
    policy: TimingPolicy,
    ack_poll: Duration,
    exit_grace: Duration,
    store: Arc<StatusStore>,
    trigger: Arc<dyn Trigger>,
}

impl Supervisor {
    pub fn new(config: &RunnerConfig, store: Arc<StatusStore>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            policy: config.timing.clone(),
            ack_poll: config.ack_poll,
            exit_grace: config.exit_grace,
            store,
            trigger,
        }
    }

    /// Supervise until the child exits. Never fails: every problem on the way
    /// is logged and reflected in the status record.
    pub async fn run<W: InputSink>(
        self,
        io: SessionIo<W>,
        capture: OutputCapture,
        input: InputQueue,
    ) -> Outcome {
        let shared = Arc::new(Shared {
            engine: Mutex::new(TimingEngine::new(self.policy.clone(), Instant::now())),
            wake: Notify::new(),
        });

        if let Err(e) = self.store.publish(StatusUpdate::monitoring("Process started")) {
            warn!("Failed to publish initial status: {}", e);
            self.store.set_warning(format!("status publish failed: {e}"));
        }
        tokio::spawn(self.trigger.notify(TriggerEvent::Started));

        let cancel = CancellationToken::new();
        let output_stop = CancellationToken::new();

        let mut output_task = tokio::spawn(output_loop(
            io.output,
            capture,
            Arc::clone(&shared),
            output_stop.clone(),
        ));
        let input_task = tokio::spawn(input_loop(input, io.sink, cancel.clone()));
        let timing_task = tokio::spawn(timing_loop(
            Arc::clone(&shared),
            Arc::clone(&self.store),
            Arc::clone(&self.trigger),
            self.ack_poll,
            cancel.clone(),
        ));

        let exit_code = match io.exit.await {
            Ok(exit) => {
                info!("Child exited with code {}", exit.code);
                Some(exit.code)
            }
            Err(_) => {
                error!("Lost track of the child process; shutting down");
                None
            }
        };

        shared.engine().exit(exit_code.unwrap_or(-1));
        cancel.cancel();

        let pauses = timing_task.await.unwrap_or_else(|e| {
            error!("Timing task failed: {}", e);
            0
        });

        let discarded_input = match input_task.await {
            Ok(mut queue) => queue.discard_pending(),
            Err(e) => {
                error!("Input task failed: {}", e);
                0
            }
        };
        if discarded_input > 0 {
            info!("Discarded {} pending input entries", discarded_input);
        }

        let capture = match tokio::time::timeout(self.exit_grace, &mut output_task).await {
            Ok(res) => res,
            Err(_) => {
                debug!("Output still open after {:?}; stopping capture", self.exit_grace);
                output_stop.cancel();
                output_task.await
            }
        };
        match capture {
            Ok(mut capture) => capture.flush(),
            Err(e) => error!("Output task failed: {}", e),
        }

        let info = match exit_code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process exit status unknown".to_string(),
        };
        let final_status = match self.store.publish(StatusUpdate::exited(exit_code, info)) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("Failed to publish exit status: {}", e);
                None
            }
        };

        self.trigger.notify(TriggerEvent::Exited { exit_code }).await;

        Outcome {
            exit_code,
            pauses,
            discarded_input,
            final_status,
        }
    }
}

async fn output_loop(
    mut output: mpsc::UnboundedReceiver<PtyOutput>,
    mut capture: OutputCapture,
    shared: Arc<Shared>,
    stop: CancellationToken,
) -> OutputCapture {
    loop {
        let chunk = tokio::select! {
            biased;
            chunk = output.recv() => chunk,
            _ = stop.cancelled() => break,
        };
        let Some(chunk) = chunk else {
            debug!("PTY output closed");
            break;
        };

        let captured = capture.capture(chunk);
        shared.engine().on_output(&captured.data, captured.at);
        shared.wake.notify_one();
    }
    capture
}

async fn input_loop<W: InputSink>(
    mut queue: InputQueue,
    sink: W,
    cancel: CancellationToken,
) -> InputQueue {
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            data = queue.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let len = data.len();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = sink.write_input(data) => match res {
                Ok(n) => debug!("Delivered {} bytes of operator input", n),
                Err(e) if e.is_closed() => {
                    warn!("Dropped {} bytes of operator input: session closed", len)
                }
                Err(e) => warn!("Dropped {} bytes of operator input: {}", len, e),
            },
        }
    }
    queue
}

async fn timing_loop(
    shared: Arc<Shared>,
    store: Arc<StatusStore>,
    trigger: Arc<dyn Trigger>,
    ack_poll: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut pauses = 0;
    loop {
        let deadline = shared.engine().next_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => continue,
            _ = sleep_until(deadline) => {}
        }

        let Some(reason) = shared.engine().poll(Instant::now()) else {
            continue;
        };
        pauses += 1;
        info!(reason = %reason, "Pausing for operator");

        let acknowledged = hold_pause(reason, &store, trigger.as_ref(), ack_poll, &cancel).await;
        if !acknowledged {
            break;
        }

        let now = Instant::now();
        if shared.engine().resume(now) {
            info!(reason = %reason, "Operator acknowledged; monitoring resumed");
            shared.wake.notify_one();
        }
        if let Err(e) = store.publish(StatusUpdate::monitoring(format!("Resumed after {reason}"))) {
            warn!("Failed to publish resume: {}", e);
            store.set_warning(format!("status publish failed: {e}"));
        }
    }
    pauses
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Publish the pause and poll until the operator acknowledges it.
///
/// Only `AI_DONE` at exactly `pause_sequence + 1` counts: that is what a
/// compare-and-set against the published record produces. Anything else in
/// the record (a stale or unsequenced write, garbage) is overwritten by
/// re-publishing the pause. Returns false if cancelled first.
async fn hold_pause(
    reason: PauseReason,
    store: &StatusStore,
    trigger: &dyn Trigger,
    ack_poll: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(ack_poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pause_sequence: Option<u64> = None;
    let mut announced = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        let Some(sequence) = pause_sequence else {
            match store.publish(StatusUpdate::waiting(reason)) {
                Ok(record) => {
                    pause_sequence = Some(record.sequence);
                    if !announced {
                        announced = true;
                        tokio::spawn(trigger.notify(TriggerEvent::Paused {
                            reason,
                            sequence: record.sequence,
                        }));
                    }
                }
                Err(e) => {
                    warn!("Failed to publish pause, retrying: {}", e);
                    store.set_warning(format!("status publish failed: {e}"));
                }
            }
            continue;
        };

        match store.read() {
            Ok(record) if record.state == RunState::AiDone && record.sequence == sequence + 1 => {
                return true;
            }
            Ok(record) if record.state == RunState::WaitingForAi && record.sequence == sequence => {}
            Ok(record) => {
                warn!(
                    state = %record.state,
                    sequence = record.sequence,
                    expected = sequence + 1,
                    "Ignoring status write that does not acknowledge the current pause"
                );
                pause_sequence = None;
            }
            Err(e) => {
                warn!("Unreadable status record while paused: {}", e);
                pause_sequence = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Transcript;
    use crate::config::FileConfig;
    use crate::context::RunLayout;
    use crate::error::StoreError;
    use crate::input::{self, InputSender};
    use crate::status::{MemoryBackend, RecordBackend};
    use pty_session::PtyError;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::task::JoinHandle;

    #[derive(Clone, Default)]
    struct RecordingTrigger {
        events: Arc<Mutex<Vec<TriggerEvent>>>,
    }

    impl Trigger for RecordingTrigger {
        fn notify(&self, event: TriggerEvent) -> crate::trigger::TriggerFuture {
            self.events.lock().unwrap().push(event);
            Box::pin(async {})
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        gate: Option<Arc<Notify>>,
    }

    impl InputSink for RecordingSink {
        async fn write_input(&self, data: Vec<u8>) -> Result<usize, PtyError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let n = data.len();
            self.written.lock().unwrap().push(data);
            Ok(n)
        }
    }

    /// Memory store whose writes fail while `failing` is set
    #[derive(Clone, Default)]
    struct FlakyBackend {
        record: Arc<MemoryBackend>,
        failing: Arc<AtomicBool>,
    }

    impl RecordBackend for FlakyBackend {
        fn load(&self) -> Result<Option<StatusRecord>, StoreError> {
            self.record.load()
        }

        fn update(
            &self,
            f: &mut dyn FnMut(Option<StatusRecord>) -> Result<StatusRecord, StoreError>,
        ) -> Result<StatusRecord, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("read-only file system")));
            }
            self.record.update(f)
        }
    }

    struct Harness {
        output: Option<mpsc::UnboundedSender<PtyOutput>>,
        exit: Option<oneshot::Sender<ChildExit>>,
        input: InputSender,
        store: Arc<StatusStore>,
        trigger: RecordingTrigger,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        layout: RunLayout,
        task: JoinHandle<Outcome>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn start() -> Self {
            Self::start_with(RecordingSink::default(), |_| StatusStore::memory(None))
        }

        fn start_with(
            sink: RecordingSink,
            store: impl FnOnce(&Path) -> StatusStore,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = RunLayout::new(dir.path().join(".runner"));
            layout.prepare().unwrap();

            let config = RunnerConfig::from_file(&FileConfig::default(), dir.path()).unwrap();
            let store = Arc::new(store(&layout.status_file()));
            let trigger = RecordingTrigger::default();
            let transcript =
                Transcript::create(&layout.transcript(), &layout.transcript_index()).unwrap();
            let capture = OutputCapture::new(transcript, Arc::clone(&store));

            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let (input, queue) = input::channel();
            let written = Arc::clone(&sink.written);

            let supervisor = Supervisor::new(&config, Arc::clone(&store), Arc::new(trigger.clone()));
            let task = tokio::spawn(supervisor.run(
                SessionIo {
                    output: output_rx,
                    exit: exit_rx,
                    sink,
                },
                capture,
                queue,
            ));

            Self {
                output: Some(output_tx),
                exit: Some(exit_tx),
                input,
                store,
                trigger,
                written,
                layout,
                task,
                _dir: dir,
            }
        }

        fn emit(&self, data: &[u8]) {
            if let Some(tx) = &self.output {
                tx.send(PtyOutput {
                    data: data.to_vec(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                })
                .unwrap();
            }
        }

        fn state(&self) -> StatusRecord {
            self.store.read().unwrap()
        }

        /// Step time until the record is paused; returns the elapsed time
        async fn wait_for_pause(&self, limit: Duration) -> (Duration, PauseReason) {
            let start = Instant::now();
            while start.elapsed() <= limit {
                let record = self.state();
                if record.state == RunState::WaitingForAi {
                    return (start.elapsed(), record.reason.unwrap());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("no pause within {limit:?}; status is {:?}", self.state());
        }

        async fn wait_for_state(&self, state: RunState, limit: Duration) {
            let start = Instant::now();
            while self.state().state != state {
                assert!(start.elapsed() <= limit, "never reached {state}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        async fn acknowledge(&self) {
            let record = self.state();
            self.store.acknowledge(record.sequence).unwrap();
            self.wait_for_state(RunState::Monitoring, Duration::from_secs(2)).await;
        }

        async fn finish(mut self, code: i32) -> (Outcome, Self) {
            self.output.take();
            self.exit.take().unwrap().send(ChildExit { code }).unwrap();
            let outcome = (&mut self.task).await.unwrap();
            (outcome, self)
        }

        fn paused_events(&self) -> Vec<PauseReason> {
            self.trigger
                .events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TriggerEvent::Paused { reason, .. } => Some(*reason),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_pauses_with_io_wait() {
        let h = Harness::start();
        h.emit(b"Proceed? [y/N]: ");
        tokio::task::yield_now().await;

        let (elapsed, reason) = h.wait_for_pause(Duration::from_secs(3)).await;
        assert_eq!(reason, PauseReason::IoWait);
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "{elapsed:?}");

        let (outcome, _) = h.finish(0).await;
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_pauses_with_stall() {
        let h = Harness::start();
        tokio::task::yield_now().await;

        let (elapsed, reason) = h.wait_for_pause(Duration::from_secs(35)).await;
        assert_eq!(reason, PauseReason::Stall);
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(30_500), "{elapsed:?}");

        // Paused: nothing else fires no matter how long the operator takes.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.paused_events(), vec![PauseReason::Stall]);

        h.finish(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_output_gets_one_heartbeat() {
        let h = Harness::start();
        let start = Instant::now();
        let mut heartbeat_at = None;

        while start.elapsed() < Duration::from_secs(310) {
            h.emit(b"working...\n");
            tokio::time::sleep(Duration::from_secs(1)).await;

            if h.state().state == RunState::WaitingForAi {
                assert_eq!(h.state().reason, Some(PauseReason::Heartbeat));
                heartbeat_at.get_or_insert(start.elapsed());
                h.acknowledge().await;
            }
        }

        assert_eq!(h.paused_events(), vec![PauseReason::Heartbeat]);
        let at = heartbeat_at.unwrap();
        assert!(at >= Duration::from_secs(300) && at <= Duration::from_secs(302), "{at:?}");

        h.finish(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_rearms_deadlines_from_ack() {
        let h = Harness::start();
        tokio::task::yield_now().await;

        let (_, reason) = h.wait_for_pause(Duration::from_secs(31)).await;
        assert_eq!(reason, PauseReason::Stall);

        tokio::time::sleep(Duration::from_secs(20)).await;
        h.acknowledge().await;
        let resumed = Instant::now();

        // The stall window restarts at the ack, not at the original pause.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.state().state, RunState::Monitoring);

        let (_, reason) = h.wait_for_pause(Duration::from_secs(3)).await;
        assert_eq!(reason, PauseReason::Stall);
        let since_resume = resumed.elapsed();
        assert!(since_resume >= Duration::from_secs(29), "{since_resume:?}");
        assert!(since_resume <= Duration::from_secs(31), "{since_resume:?}");

        h.finish(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_input_is_delivered_in_order() {
        let h = Harness::start();
        let markers: Vec<Vec<u8>> = (1..=5).map(|i| format!("MARK-{i}\n").into_bytes()).collect();
        for m in &markers {
            assert!(h.input.send(m.clone()));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*h.written.lock().unwrap(), markers);

        h.finish(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_while_paused_is_terminal() {
        let gate = Arc::new(Notify::new());
        let sink = RecordingSink {
            written: Arc::default(),
            gate: Some(Arc::clone(&gate)),
        };
        let h = Harness::start_with(sink, |_| StatusStore::memory(None));
        h.emit(b"Overwrite existing files? ");
        tokio::task::yield_now().await;
        h.wait_for_pause(Duration::from_secs(3)).await;

        // First entry is stuck in the sink; the rest are still queued.
        h.input.send("y\n");
        h.input.send("y\n");
        h.input.send("y\n");
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.emit(b"aborted\n");
        tokio::task::yield_now().await;
        let (outcome, h) = h.finish(3).await;

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.pauses, 1);
        assert_eq!(outcome.discarded_input, 2);

        let status = h.state();
        assert_eq!(status.state, RunState::Exited);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(outcome.final_status.unwrap().sequence, status.sequence);

        let transcript = Transcript::read_all(&h.layout.transcript()).unwrap();
        assert_eq!(transcript, b"Overwrite existing files? aborted\n");

        let events = h.trigger.events.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&TriggerEvent::Started));
        assert_eq!(
            events.last(),
            Some(&TriggerEvent::Exited { exit_code: Some(3) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsequenced_ack_is_rejected_and_pause_republished() {
        let h = Harness::start_with(RecordingSink::default(), |path| StatusStore::file(path, None));
        tokio::task::yield_now().await;
        h.wait_for_pause(Duration::from_secs(31)).await;
        let paused = h.state();

        // Stale token through the store: rejected outright.
        let err = h.store.acknowledge(paused.sequence - 1).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(h.state(), paused);

        // Raw write that skips the sequence: the supervisor restores the pause.
        std::fs::write(h.layout.status_file(), r#"{"state": "AI_DONE"}"#).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let republished = h.state();
        assert_eq!(republished.state, RunState::WaitingForAi);
        assert_eq!(republished.reason, Some(PauseReason::Stall));
        assert!(republished.sequence > paused.sequence);
        assert_eq!(h.paused_events().len(), 1);

        // A correct ack against the new record resumes.
        h.acknowledge().await;
        h.finish(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_does_not_wait_forever_on_open_output() {
        let h = Harness::start();
        h.emit(b"background job still holds the terminal\n");
        tokio::task::yield_now().await;

        // Keep the output side open, as a lingering grandchild would.
        let output = h.output.clone();
        let (outcome, _) = h.finish(0).await;
        drop(output);

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.final_status.unwrap().state, RunState::Exited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_write_failures_do_not_stop_supervision() {
        let backend = FlakyBackend::default();
        backend.failing.store(true, Ordering::SeqCst);
        let store_backend = backend.clone();
        let h = Harness::start_with(RecordingSink::default(), move |_| {
            StatusStore::new(Box::new(store_backend), None)
        });
        h.emit(b"Proceed? [y/N]: ");
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let degraded = h.state();
        assert_eq!(degraded.state, RunState::Monitoring);
        let warning = degraded.warning.unwrap();
        assert!(warning.contains("status publish failed"), "{warning}");
        assert!(h.paused_events().is_empty());

        // Writes come back: the pending pause is published with the warning.
        backend.failing.store(false, Ordering::SeqCst);
        let (_, reason) = h.wait_for_pause(Duration::from_secs(2)).await;
        assert_eq!(reason, PauseReason::IoWait);
        assert!(backend.record.load().unwrap().unwrap().warning.is_some());
        assert_eq!(h.paused_events(), vec![PauseReason::IoWait]);

        h.acknowledge().await;
        let (outcome, _) = h.finish(0).await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.pauses, 1);
        assert_eq!(outcome.final_status.unwrap().state, RunState::Exited);
    }
}
