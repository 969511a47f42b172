//! Output Timing State Machine
//!
//! Classifies the timing of a child's output stream into pause decisions.
//!
//! # Architecture
//!
//! The engine races three deadlines against incoming output:
//! - `IO_WAIT` - output went quiet mid-line (probably an interactive prompt)
//! - `STALL` - no output at all for a long window
//! - `HEARTBEAT` - fixed-cadence check-in while monitoring
//!
//! And maintains a state machine:
//! - `Monitoring` - deadlines armed
//! - `WaitingForAi` - paused; deadlines frozen until the operator acknowledges
//! - `Exited` - terminal

mod engine;
mod state;

pub use engine::{PromptHeuristic, TimingEngine, TimingPolicy};
pub use state::{PauseReason, Phase, RunState};
