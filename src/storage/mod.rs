//! Log storage: the segmented in-memory log, its durability seam, and the
//! background compaction machinery.

pub mod bits;
pub mod cleaner;
pub mod compactor;
pub mod log;
pub mod segment;
pub mod stable;

pub use cleaner::{ReleaseHook, SegmentCleaner, NO_OFFSET};
pub use compactor::{Compactor, RetentionPolicy};
pub use log::{LogEntry, SegmentedLog};
pub use segment::Segment;
pub use stable::{FileStableStore, MemoryStableStore, StableStore};

use crate::error::{QuorumError, Result};
use crate::types::LogIndex;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Durability seam for log mutations. Consensus writes go through here before
/// any response that depends on them; a failure is treated as fatal by the
/// caller.
pub trait LogStore: Send + Sync {
    /// Durably record newly appended entries.
    fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Durably drop every entry with index >= `index`.
    fn truncate_from(&self, index: LogIndex) -> Result<()>;

    /// Durably replace the segment at `base` with only the retained indices.
    fn rewrite_segment(&self, base: LogIndex, retained: &[LogIndex]) -> Result<()>;
}

/// In-memory [`LogStore`] used in tests and for volatile deployments. Records
/// every mutation and can be told to fail the next write.
pub struct MemoryLogStore {
    entries: Mutex<Vec<LogEntry>>,
    rewrites: Mutex<Vec<(LogIndex, Vec<LogIndex>)>>,
    fail_writes: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            rewrites: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, for fault-injection tests.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn rewrite_count(&self) -> usize {
        self.rewrites.lock().len()
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QuorumError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLogStore {
    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.check()?;
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        self.check()?;
        self.entries.lock().retain(|e| e.index < index);
        Ok(())
    }

    fn rewrite_segment(&self, base: LogIndex, retained: &[LogIndex]) -> Result<()> {
        self.check()?;
        self.rewrites.lock().push((base, retained.to_vec()));
        Ok(())
    }
}
