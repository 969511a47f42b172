//! Run state types shared by the timing engine and the status store.

use serde::{Deserialize, Serialize};

/// Why the supervisor stopped and handed control to the operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    /// Output stopped mid-line; the child is probably showing a prompt
    IoWait,
    /// No output at all for the stall window
    Stall,
    /// Periodic check-in, independent of output
    Heartbeat,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::IoWait => "IO_WAIT",
            PauseReason::Stall => "STALL",
            PauseReason::Heartbeat => "HEARTBEAT",
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The externally visible state, as written to `status.json`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Monitoring,
    WaitingForAi,
    AiDone,
    Exited,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Monitoring => "MONITORING",
            RunState::WaitingForAi => "WAITING_FOR_AI",
            RunState::AiDone => "AI_DONE",
            RunState::Exited => "EXITED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal phase of the timing engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Monitoring,
    WaitingForAi(PauseReason),
    Exited { code: i32 },
}

impl Phase {
    pub fn is_paused(&self) -> bool {
        matches!(self, Phase::WaitingForAi(_))
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, Phase::Exited { .. })
    }
}
