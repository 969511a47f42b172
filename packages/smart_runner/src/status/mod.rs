//! Status Store
//!
//! The durable, externally readable record of the run state, and the only
//! channel through which the operator resumes a paused session.
//!
//! Every transition bumps a monotonic `sequence`. Operator writes carry the
//! sequence they last read; a write against any other sequence is rejected
//! with [`StoreError::Conflict`], so a stale acknowledgement can never clear
//! a pause it did not see.

mod backend;

pub use backend::{FileBackend, MemoryBackend, RecordBackend};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::SessionContext;
use crate::error::StoreError;
use crate::timing::{PauseReason, RunState};

/// The record as persisted in `status.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: RunState,
    #[serde(default)]
    pub reason: Option<PauseReason>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_pipe: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Persistence problem the supervisor is currently degraded by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl StatusRecord {
    /// A fresh `MONITORING` record at sequence 0
    pub fn initial() -> Self {
        Self {
            state: RunState::Monitoring,
            reason: None,
            updated_at: Utc::now(),
            sequence: 0,
            session_id: None,
            label: None,
            runner_pid: None,
            child_pid: None,
            started_at: None,
            cmd: None,
            working_dir: None,
            input_pipe: None,
            transcript: None,
            info: None,
            exit_code: None,
            warning: None,
        }
    }

    fn stamp_context(&mut self, ctx: &SessionContext) {
        self.session_id = Some(ctx.session_id);
        self.label = Some(ctx.label.clone());
        self.runner_pid = Some(ctx.runner_pid);
        self.child_pid = ctx.child_pid;
        self.started_at = Some(ctx.started_at);
        self.cmd = Some(ctx.command.clone());
        self.working_dir = Some(ctx.working_dir.clone());
        self.input_pipe = Some(ctx.layout.input_pipe());
        self.transcript = Some(ctx.layout.transcript());
    }
}

/// A supervisor-side transition
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub state: RunState,
    pub reason: Option<PauseReason>,
    pub info: Option<String>,
    pub exit_code: Option<i32>,
}

impl StatusUpdate {
    pub fn monitoring(info: impl Into<String>) -> Self {
        Self {
            state: RunState::Monitoring,
            reason: None,
            info: Some(info.into()),
            exit_code: None,
        }
    }

    pub fn waiting(reason: PauseReason) -> Self {
        Self {
            state: RunState::WaitingForAi,
            reason: Some(reason),
            info: None,
            exit_code: None,
        }
    }

    pub fn exited(exit_code: Option<i32>, info: impl Into<String>) -> Self {
        Self {
            state: RunState::Exited,
            reason: None,
            info: Some(info.into()),
            exit_code,
        }
    }
}

struct StoreInner {
    last_sequence: u64,
    warning: Option<String>,
}

/// Optimistic-concurrency wrapper around a [`RecordBackend`]
pub struct StatusStore {
    backend: Box<dyn RecordBackend>,
    context: Option<SessionContext>,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl StatusStore {
    pub fn new(backend: Box<dyn RecordBackend>, context: Option<SessionContext>) -> Self {
        Self {
            backend,
            context,
            inner: Mutex::new(StoreInner {
                last_sequence: 0,
                warning: None,
            }),
        }
    }

    /// Store backed by `status.json` at `path`
    pub fn file(path: impl AsRef<Path>, context: Option<SessionContext>) -> Self {
        Self::new(Box::new(FileBackend::new(path.as_ref())), context)
    }

    /// Store that lives only in this process
    pub fn memory(context: Option<SessionContext>) -> Self {
        Self::new(Box::new(MemoryBackend::default()), context)
    }

    /// Current snapshot, with any active persistence warning overlaid
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be read or holds a malformed record.
    pub fn read(&self) -> Result<StatusRecord, StoreError> {
        let mut record = self.backend.load()?.unwrap_or_else(StatusRecord::initial);
        if let Some(warning) = &self.lock().warning {
            record.warning = Some(warning.clone());
        }
        Ok(record)
    }

    /// Compare-and-set write: succeeds only if `token` is the current sequence.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when `token` is stale; the record is left unchanged.
    pub fn write(
        &self,
        state: RunState,
        reason: Option<PauseReason>,
        token: u64,
    ) -> Result<StatusRecord, StoreError> {
        let record = self.backend.update(&mut |current: Option<StatusRecord>| {
            let mut record = current.unwrap_or_else(StatusRecord::initial);
            if record.sequence != token {
                return Err(StoreError::Conflict {
                    expected: token,
                    current: record.sequence,
                });
            }
            record.state = state;
            record.reason = reason;
            record.sequence += 1;
            record.updated_at = Utc::now();
            Ok(record)
        })?;
        debug!(state = %record.state, sequence = record.sequence, "status written");
        Ok(record)
    }

    /// Operator acknowledgement of the pause it read at sequence `token`
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when `token` is stale.
    pub fn acknowledge(&self, token: u64) -> Result<StatusRecord, StoreError> {
        self.write(RunState::AiDone, None, token)
    }

    /// Unconditional supervisor transition; always advances the sequence
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be written.
    pub fn publish(&self, update: StatusUpdate) -> Result<StatusRecord, StoreError> {
        let mut inner = self.lock();
        let last_sequence = inner.last_sequence;
        let warning = inner.warning.clone();

        let record = self.backend.update(&mut |current: Option<StatusRecord>| {
            let mut record = current.unwrap_or_else(StatusRecord::initial);
            record.sequence = record.sequence.max(last_sequence) + 1;
            record.state = update.state;
            record.reason = update.reason;
            record.info = update.info.clone();
            record.exit_code = update.exit_code;
            record.warning = warning.clone();
            record.updated_at = Utc::now();
            if let Some(ctx) = &self.context {
                record.stamp_context(ctx);
            }
            Ok(record)
        });

        match record {
            Ok(record) => {
                inner.last_sequence = record.sequence;
                debug!(
                    state = %record.state,
                    reason = ?record.reason,
                    sequence = record.sequence,
                    "status published"
                );
                Ok(record)
            }
            Err(e) => {
                // Keep the sequence moving so an operator token read earlier goes stale.
                inner.last_sequence += 1;
                Err(e)
            }
        }
    }

    /// Enter degraded mode; the warning shows on every read until cleared.
    ///
    /// The warning is written into the record without advancing the
    /// sequence, so an operator token read before it stays valid.
    pub fn set_warning(&self, warning: impl Into<String>) {
        let warning = warning.into();
        let mut inner = self.lock();
        inner.warning = Some(warning.clone());
        self.persist_warning(Some(warning));
    }

    pub fn clear_warning(&self) {
        let mut inner = self.lock();
        if inner.warning.take().is_some() {
            self.persist_warning(None);
        }
    }

    // Callers hold the inner lock so a concurrent publish cannot interleave.
    fn persist_warning(&self, warning: Option<String>) {
        let result = self.backend.update(&mut |current: Option<StatusRecord>| {
            let mut record = match current {
                Some(record) => record,
                None => {
                    let mut record = StatusRecord::initial();
                    if let Some(ctx) = &self.context {
                        record.stamp_context(ctx);
                    }
                    record
                }
            };
            record.warning = warning.clone();
            record.updated_at = Utc::now();
            Ok(record)
        });
        // The status file itself may be what is failing.
        if let Err(e) = result {
            warn!("Failed to persist status warning: {}", e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
