//! PTY Session - one child process behind a pseudo-terminal
//!
//! Spawns a program on the slave side of a fresh PTY and exposes:
//! - an ordered, finite stream of output chunks (combined stdout/stderr)
//! - a single-writer input path ([`PtyHandle::write`])
//! - the child's exit status
//!
//! # Example
//!
//! ```no_run
//! use pty_session::{PtyConfig, PtySession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut session = PtySession::start(PtyConfig::shell("echo hello")).unwrap();
//!
//!     session.handle().write(b"ignored\n").await.ok();
//!
//!     while let Some(chunk) = session.read_chunk().await {
//!         print!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//!
//!     let exit = session.wait().await.unwrap();
//!     println!("exited with {}", exit.code);
//! }
//! ```

mod error;
pub mod session;

pub use error::PtyError;
pub use session::{ChildExit, PtyConfig, PtyHandle, PtyOutput, PtySession, PtyState};
