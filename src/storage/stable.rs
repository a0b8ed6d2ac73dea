//! Durable term and vote storage.
//!
//! The election safety argument depends on `current_term` and `voted_for`
//! surviving restarts, so every mutation is flushed through a [`StableStore`]
//! before the server acts on it.

use crate::error::{QuorumError, Result};
use crate::state::PersistentState;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

pub trait StableStore: Send + Sync {
    /// Load the last persisted state, or `None` on first boot.
    fn load(&self) -> Result<Option<PersistentState>>;

    /// Persist `state`. Must not return until the write is durable.
    fn save(&self, state: &PersistentState) -> Result<()>;
}

/// File-backed store: bincode payload written to a sibling temp file and
/// atomically renamed into place, so a crash mid-write leaves the previous
/// state intact.
pub struct FileStableStore {
    path: PathBuf,
}

impl FileStableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StableStore for FileStableStore {
    fn load(&self) -> Result<Option<PersistentState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QuorumError::Storage(e.to_string())),
        };
        let state = bincode::deserialize(&bytes)?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistentState) -> Result<()> {
        let bytes = bincode::serialize(state)?;
        let temp = self.temp_path();
        write_and_sync(&temp, &bytes)?;
        std::fs::rename(&temp, &self.path).map_err(|e| QuorumError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file =
        std::fs::File::create(path).map_err(|e| QuorumError::Storage(e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| QuorumError::Storage(e.to_string()))?;
    file.sync_all()
        .map_err(|e| QuorumError::Storage(e.to_string()))?;
    Ok(())
}

/// In-memory store for tests, with optional write-failure injection.
pub struct MemoryStableStore {
    state: Mutex<Option<PersistentState>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStableStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for MemoryStableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StableStore for MemoryStableStore {
    fn load(&self) -> Result<Option<PersistentState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistentState) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QuorumError::Storage("injected write failure".into()));
        }
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStableStore::new(dir.path().join("hard_state"));
        assert!(store.load().unwrap().is_none());

        let state = PersistentState {
            current_term: 7,
            voted_for: Some(3),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn save_replaces_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStableStore::new(dir.path().join("hard_state"));
        store
            .save(&PersistentState {
                current_term: 1,
                voted_for: None,
            })
            .unwrap();
        store
            .save(&PersistentState {
                current_term: 2,
                voted_for: Some(1),
            })
            .unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.current_term, 2);
        assert_eq!(loaded.voted_for, Some(1));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStableStore::new(dir.path().join("hard_state"));
        store
            .save(&PersistentState {
                current_term: 1,
                voted_for: None,
            })
            .unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("hard_state")]);
    }

    #[test]
    fn memory_store_failure_injection() {
        let store = MemoryStableStore::new();
        store.set_failing(true);
        let err = store
            .save(&PersistentState::default())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
