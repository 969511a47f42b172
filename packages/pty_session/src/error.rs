use std::fmt;

/// Errors that can occur while driving a PTY session
#[derive(Debug)]
pub enum PtyError {
    /// The PTY could not be allocated or the program could not be spawned
    LaunchFailed(String),
    /// Writing to the PTY failed at the OS level
    WriteFailed(String),
    /// The child has exited; its input side no longer accepts bytes
    SessionClosed,
    /// Failed to signal the child process
    KillFailed(String),
    /// Channel communication error with the session actor
    ChannelError(String),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtyError::LaunchFailed(msg) => write!(f, "Failed to launch PTY session: {}", msg),
            PtyError::WriteFailed(msg) => write!(f, "Failed to write to PTY: {}", msg),
            PtyError::SessionClosed => write!(f, "PTY session is closed"),
            PtyError::KillFailed(msg) => write!(f, "Failed to signal PTY process: {}", msg),
            PtyError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for PtyError {}

impl PtyError {
    /// True when the error means the session is gone rather than a transient failure
    pub fn is_closed(&self) -> bool {
        matches!(self, PtyError::SessionClosed | PtyError::ChannelError(_))
    }
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::LaunchFailed(format!("{:#}", err))
    }
}
