//! Durable record backends for the status store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

use super::StatusRecord;
use crate::error::StoreError;

/// Where the status record lives.
///
/// `update` must be atomic with respect to other `update` calls (including
/// from other processes) and must never expose a partially written record to
/// `load`.
pub trait RecordBackend: Send + Sync {
    fn load(&self) -> Result<Option<StatusRecord>, StoreError>;

    fn update(
        &self,
        f: &mut dyn FnMut(Option<StatusRecord>) -> Result<StatusRecord, StoreError>,
    ) -> Result<StatusRecord, StoreError>;
}

/// In-process backend for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryBackend {
    record: Mutex<Option<StatusRecord>>,
}

impl RecordBackend for MemoryBackend {
    fn load(&self) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn update(
        &self,
        f: &mut dyn FnMut(Option<StatusRecord>) -> Result<StatusRecord, StoreError>,
    ) -> Result<StatusRecord, StoreError> {
        let mut slot = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        let next = f(slot.clone())?;
        *slot = Some(next.clone());
        Ok(next)
    }
}

/// `status.json` on disk.
///
/// Writers serialize on an advisory lock next to the record and replace the
/// record by rename, so readers need no lock and never see a torn write.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "status.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn save(&self, record: &StatusRecord) -> Result<(), StoreError> {
        let tmp = self.sibling(&format!(".tmp-{}", std::process::id()));
        let mut json = serde_json::to_vec_pretty(record)?;
        json.push(b'\n');

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_data()?;
        drop(file);

        std::fs::rename(&tmp, &self.path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })?;
        Ok(())
    }
}

impl RecordBackend for FileBackend {
    fn load(&self) -> Result<Option<StatusRecord>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        f: &mut dyn FnMut(Option<StatusRecord>) -> Result<StatusRecord, StoreError>,
    ) -> Result<StatusRecord, StoreError> {
        let _guard = lock_exclusive(&self.sibling(".lock"))?;
        let current = match self.load() {
            // A hand-edited record that no longer parses is replaced, not fatal.
            Err(StoreError::Malformed(e)) => {
                warn!("Replacing malformed status record {}: {}", self.path.display(), e);
                None
            }
            other => other?,
        };
        let next = f(current)?;
        self.save(&next)?;
        Ok(next)
    }
}

#[cfg(unix)]
fn lock_exclusive(path: &Path) -> Result<nix::fcntl::Flock<std::fs::File>, StoreError> {
    use nix::fcntl::{Flock, FlockArg};

    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| StoreError::Io(std::io::Error::from(errno)))
}

#[cfg(not(unix))]
fn lock_exclusive(path: &Path) -> Result<std::fs::File, StoreError> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}
