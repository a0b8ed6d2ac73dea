//! Per-segment liveness tracking.
//!
//! A [`SegmentCleaner`] tracks, bit by bit, which relative offsets within one
//! segment have been released. A set bit means the entry at that offset has
//! been superseded and may be dropped when the segment is rewritten; an unset
//! bit, including any offset beyond the current capacity, means the entry is
//! still required. Bits transition only from unset to set, which is what
//! makes concurrent reads from the compaction pass safe.

use super::bits::BitArray;
use super::log::LogEntry;
use crate::error::{QuorumError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Initial capacity of a cleaner's bit array, in bits.
const INITIAL_CAPACITY: u64 = 1024;

/// Sentinel for an entry that has no offset within a segment.
pub const NO_OFFSET: i64 = -1;

/// Callback carried by entries with extra release semantics. Invoked with the
/// entry's offset and the cleaner of the segment it lives in.
pub type ReleaseHook = Arc<dyn Fn(i64, &SegmentCleaner) + Send + Sync>;

/// Tracks released offsets for a single segment.
///
/// Bit storage is grown by doubling as offsets are released; growth never
/// loses previously recorded bits. Resize is exclusive with concurrent reads
/// and writes on the same cleaner, enforced by the interior lock; plain bit
/// reads take only the read side.
pub struct SegmentCleaner {
    bits: RwLock<BitArray>,
}

impl SegmentCleaner {
    pub fn new() -> Self {
        Self::with_bits(BitArray::allocate(INITIAL_CAPACITY))
    }

    fn with_bits(bits: BitArray) -> Self {
        Self {
            bits: RwLock::new(bits),
        }
    }

    /// Release the entry at `offset` from the segment.
    ///
    /// Grows capacity by doubling until it covers `offset`. Returns whether
    /// this call performed the release; a repeated `clean` of the same offset
    /// returns `false`.
    pub fn clean(&self, offset: i64) -> Result<bool> {
        if offset < 0 {
            return Err(QuorumError::InvalidOffset(offset));
        }
        let offset = offset as u64;
        let mut bits = self.bits.write();
        if bits.size() <= offset {
            let mut size = bits.size().max(1);
            while size <= offset {
                size *= 2;
            }
            bits.resize(size);
        }
        Ok(bits.set(offset))
    }

    /// Whether the entry at `offset` must still be retained.
    ///
    /// True for every offset that has not been explicitly released, including
    /// offsets beyond the current capacity. The [`NO_OFFSET`] sentinel
    /// reports `false`.
    pub fn is_clean(&self, offset: i64) -> bool {
        if offset == NO_OFFSET {
            return false;
        }
        let offset = offset as u64;
        let bits = self.bits.read();
        bits.size() <= offset || !bits.get(offset)
    }

    /// Number of offsets released so far.
    pub fn count(&self) -> u64 {
        self.bits.read().count()
    }

    /// Independent snapshot of the current bit state. Releases recorded after
    /// the fork are not visible through the copy.
    pub fn copy(&self) -> SegmentCleaner {
        Self::with_bits(self.bits.read().copy())
    }

    /// Hand the entry at `offset` to this cleaner. Entries carrying a release
    /// hook get it invoked with `(offset, self)` so entry types with extra
    /// cleanup semantics can register further releases.
    pub fn transfer(&self, offset: i64, entry: &LogEntry) {
        if let Some(hook) = &entry.release {
            hook(offset, self);
        }
    }

    /// Explicitly release the backing bit storage.
    pub fn close(&self) {
        self.bits.write().close();
    }
}

impl Default for SegmentCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = self.bits.read();
        f.debug_struct("SegmentCleaner")
            .field("capacity", &bits.size())
            .field("released", &bits.count())
            .finish()
    }
}
