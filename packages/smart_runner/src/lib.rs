//! Smart Runner
//!
//! Runs a long-lived command inside a pseudo-terminal and hands control to an
//! external operator exactly when judgment is needed: the command appears to
//! be waiting at a prompt, has gone silent, or a periodic check-in is due.
//!
//! The operator never talks to the supervisor directly. It reads
//! `status.json` in the run directory, writes bytes into `input.pipe`, and
//! acknowledges a pause with a sequence-checked write back to the status
//! record.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use smart_runner::cli::{self, DirArgs, RunArgs};
//!
//! let code = cli::run::run_command(RunArgs {
//!     cmd: "./deploy.sh".into(),
//!     name: "deploy".into(),
//!     payload: "Answer deploy prompts conservatively.".into(),
//!     location: DirArgs::default(),
//!     headless: true,
//! })
//! .await?;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod input;
pub mod status;
pub mod supervisor;
pub mod timing;
pub mod trigger;

pub use capture::{OutputCapture, Transcript};
pub use config::{FileConfig, RunnerConfig};
pub use context::{RunLayout, SessionContext};
pub use error::{LaunchError, StoreError};
pub use input::{InputQueue, InputSender, InputSink};
pub use status::{StatusRecord, StatusStore, StatusUpdate};
pub use supervisor::{Outcome, SessionIo, Supervisor};
pub use timing::{PauseReason, PromptHeuristic, RunState, TimingEngine, TimingPolicy};
pub use trigger::{CommandTrigger, NoopTrigger, Trigger, TriggerEvent};
