//! Timing Engine
//!
//! Pure state machine: every method takes the current instant explicitly, so
//! the same code runs against the real clock and against paused test time.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::state::{PauseReason, Phase};

/// Decides whether a chunk of output ends a line or leaves a prompt open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptHeuristic {
    /// A chunk whose last character is one of `terminators` completes a line;
    /// anything else is treated as a possible prompt.
    TrailingTerminator { terminators: String },
    /// Never treat output as a prompt; IO_WAIT never fires.
    Disabled,
}

impl Default for PromptHeuristic {
    fn default() -> Self {
        PromptHeuristic::TrailingTerminator {
            terminators: "\n".to_string(),
        }
    }
}

impl PromptHeuristic {
    /// True if this chunk leaves the terminal waiting mid-line
    pub fn leaves_prompt_open(&self, chunk: &[u8]) -> bool {
        match self {
            PromptHeuristic::Disabled => false,
            PromptHeuristic::TrailingTerminator { terminators } => {
                if chunk.is_empty() {
                    return false;
                }
                !terminators.chars().any(|t| {
                    let mut buf = [0u8; 4];
                    chunk.ends_with(t.encode_utf8(&mut buf).as_bytes())
                })
            }
        }
    }
}

/// Deadlines and the prompt heuristic.
///
/// Each threshold is the instant a deadline fires: a pause is due once the
/// idle time reaches it, so a sleep to [`TimingEngine::next_deadline`]
/// followed by [`TimingEngine::poll`] always fires. Any output before that
/// instant moves the window.
#[derive(Clone, Debug)]
pub struct TimingPolicy {
    /// Idle time after a prompt-like chunk before IO_WAIT
    pub io_wait: Duration,
    /// Idle time after any output before STALL
    pub stall: Duration,
    /// Interval between HEARTBEAT checks, regardless of output
    pub heartbeat: Duration,
    pub prompt: PromptHeuristic,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            io_wait: Duration::from_secs(2),
            stall: Duration::from_secs(30),
            heartbeat: Duration::from_secs(300),
            prompt: PromptHeuristic::default(),
        }
    }
}

/// Races idle-wait, stall and heartbeat deadlines against output arrival
#[derive(Debug)]
pub struct TimingEngine {
    policy: TimingPolicy,
    phase: Phase,
    /// Origin of the current idle window: last output, or the last resume
    window_start: Instant,
    /// Latest chunk left a prompt open and IO_WAIT has not fired for it yet
    prompt_open: bool,
    /// STALL may still fire in this idle window
    stall_armed: bool,
    heartbeat_start: Instant,
}

impl TimingEngine {
    pub fn new(policy: TimingPolicy, now: Instant) -> Self {
        Self {
            policy,
            phase: Phase::Monitoring,
            window_start: now,
            prompt_open: false,
            stall_armed: true,
            heartbeat_start: now,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record an output chunk that arrived at `at`.
    ///
    /// While paused the idle window stays frozen; only the prompt flag follows
    /// the newest chunk, so a prompt printed in answer to operator input is
    /// still noticed after resume.
    pub fn on_output(&mut self, chunk: &[u8], at: Instant) {
        if chunk.is_empty() {
            return;
        }
        match self.phase {
            Phase::Exited { .. } => {}
            Phase::WaitingForAi(_) => {
                self.prompt_open = self.policy.prompt.leaves_prompt_open(chunk);
            }
            Phase::Monitoring => {
                self.window_start = self.window_start.max(at);
                self.prompt_open = self.policy.prompt.leaves_prompt_open(chunk);
                self.stall_armed = true;
            }
        }
    }

    /// The nearest armed deadline, or `None` when nothing is being timed
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.phase != Phase::Monitoring {
            return None;
        }

        let mut next = self.heartbeat_start + self.policy.heartbeat;
        if self.prompt_open {
            next = next.min(self.window_start + self.policy.io_wait);
        }
        if self.stall_armed {
            next = next.min(self.window_start + self.policy.stall);
        }
        Some(next)
    }

    /// Evaluate deadlines at `now`; on expiry, enter `WaitingForAi`.
    ///
    /// When several deadlines are due at once, IO_WAIT beats STALL beats
    /// HEARTBEAT.
    pub fn poll(&mut self, now: Instant) -> Option<PauseReason> {
        if self.phase != Phase::Monitoring {
            return None;
        }

        let idle = now.saturating_duration_since(self.window_start);

        let reason = if self.prompt_open && idle >= self.policy.io_wait {
            PauseReason::IoWait
        } else if self.stall_armed && idle >= self.policy.stall {
            PauseReason::Stall
        } else if now.saturating_duration_since(self.heartbeat_start) >= self.policy.heartbeat {
            PauseReason::Heartbeat
        } else {
            return None;
        };

        match reason {
            // One pause per idle window: IO_WAIT and STALL share it.
            PauseReason::IoWait | PauseReason::Stall => {
                self.prompt_open = false;
                self.stall_armed = false;
            }
            PauseReason::Heartbeat => {
                self.heartbeat_start = now;
                self.prompt_open = false;
            }
        }

        debug!(reason = %reason, idle_ms = idle.as_millis() as u64, "timing deadline fired");
        self.phase = Phase::WaitingForAi(reason);
        Some(reason)
    }

    /// Leave `WaitingForAi`, re-arming every deadline from `now`.
    ///
    /// Returns false if the engine was not paused.
    pub fn resume(&mut self, now: Instant) -> bool {
        if !self.phase.is_paused() {
            return false;
        }
        self.phase = Phase::Monitoring;
        self.window_start = now;
        self.heartbeat_start = now;
        self.stall_armed = true;
        true
    }

    /// Terminal transition; preempts everything else
    pub fn exit(&mut self, code: i32) {
        self.phase = Phase::Exited { code };
        self.prompt_open = false;
        self.stall_armed = false;
    }
}
