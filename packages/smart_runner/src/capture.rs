//! Output capture: durable transcript plus timestamped forwarding.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pty_session::PtyOutput;

use crate::status::StatusStore;

/// One line of `output.index.jsonl`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Byte offset of the chunk in `output.log`
    pub offset: u64,
    pub len: u64,
    /// Arrival time, milliseconds since the Unix epoch
    pub at_ms: i64,
}

/// Append-only transcript: raw bytes in one file, a per-chunk index in another.
///
/// Each chunk is a single `write_all` on an `O_APPEND` handle, so a concurrent
/// reader sees whole chunks. Index timestamps never go backwards.
#[derive(Debug)]
pub struct Transcript {
    log: File,
    index: File,
    offset: u64,
    last_at_ms: i64,
}

impl Transcript {
    pub fn create(log_path: &Path, index_path: &Path) -> std::io::Result<Self> {
        let open = |p: &Path| OpenOptions::new().create(true).append(true).open(p);
        let log = open(log_path)?;
        let index = open(index_path)?;
        let offset = log.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            log,
            index,
            offset,
            last_at_ms: i64::MIN,
        })
    }

    /// Append one chunk; returns its index entry
    pub fn append(&mut self, data: &[u8], at_ms: i64) -> std::io::Result<IndexEntry> {
        let entry = IndexEntry {
            offset: self.offset,
            len: data.len() as u64,
            at_ms: at_ms.max(self.last_at_ms),
        };

        self.log.write_all(data)?;
        self.offset += entry.len;
        self.last_at_ms = entry.at_ms;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.index.write_all(&line)?;
        Ok(entry)
    }

    /// Bytes appended so far
    pub(crate) fn len(&self) -> u64 {
        self.offset
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.log.flush()?;
        self.index.flush()?;
        self.log.sync_data()?;
        self.index.sync_data()
    }

    /// Whole transcript as written so far
    pub fn read_all(path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    pub fn read_index(path: &Path) -> std::io::Result<Vec<IndexEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

/// A chunk as seen by the timing engine
#[derive(Clone, Debug)]
pub struct CapturedChunk {
    pub data: Vec<u8>,
    /// Monotonic arrival instant; the only clock timing decisions use
    pub at: Instant,
}

/// Persists every PTY chunk, optionally echoes it, and stamps it for timing.
///
/// Persistence failures never stop capture: the first failure of a streak
/// raises a warning on the status store, and the next successful append
/// clears it.
pub struct OutputCapture {
    transcript: Transcript,
    echo: Option<Box<dyn Write + Send>>,
    store: Arc<StatusStore>,
    degraded: bool,
}

impl std::fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCapture")
            .field("transcript", &self.transcript)
            .field("echo", &self.echo.is_some())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl OutputCapture {
    pub fn new(transcript: Transcript, store: Arc<StatusStore>) -> Self {
        Self {
            transcript,
            echo: None,
            store,
            degraded: false,
        }
    }

    /// Mirror raw output to `writer` (the runner's stdout outside headless mode)
    pub fn with_echo(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.echo = Some(writer);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn capture(&mut self, output: PtyOutput) -> CapturedChunk {
        let at = Instant::now();

        match self.transcript.append(&output.data, output.timestamp) {
            Ok(_) if self.degraded => {
                info!("Transcript writes recovered");
                self.degraded = false;
                self.store.clear_warning();
            }
            Ok(_) => {}
            Err(e) if !self.degraded => {
                warn!("Transcript append failed, continuing without persistence: {}", e);
                self.degraded = true;
                self.store.set_warning(format!("transcript write failed: {e}"));
            }
            Err(e) => debug!("Transcript append still failing: {}", e),
        }

        if let Some(echo) = self.echo.as_mut() {
            if let Err(e) = echo.write_all(&output.data).and_then(|_| echo.flush()) {
                debug!("Echo to stdout failed, disabling: {}", e);
                self.echo = None;
            }
        }

        CapturedChunk {
            data: output.data,
            at,
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.transcript.flush() {
            warn!("Final transcript flush failed: {}", e);
            self.store.set_warning(format!("transcript flush failed: {e}"));
        }
    }

    pub fn transcript_len(&self) -> u64 {
        self.transcript.len()
    }
}
