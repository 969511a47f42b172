use std::path::PathBuf;

use pty_session::PtyError;

/// Failures of the durable status record
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's sequence token is stale; re-read before retrying
    #[error("stale sequence token {expected}: status is at sequence {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("status record I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("status record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Fatal errors before a session exists
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pty(#[from] PtyError),
}
