//! Log segments.
//!
//! A segment is a contiguous run of entries starting at a fixed base index.
//! Every segment is paired 1:1 with a [`SegmentCleaner`] created with it and
//! discarded with it. After a compaction rewrite a segment may hold a sparse
//! subset of its index range; offsets stay relative to the original base so
//! cleaner state remains addressable.

use super::cleaner::SegmentCleaner;
use super::log::LogEntry;
use crate::types::LogIndex;
use std::sync::Arc;

#[derive(Debug)]
pub struct Segment {
    /// Index of the first entry this segment can hold.
    base: LogIndex,
    /// Entries in ascending index order; contiguous until a rewrite.
    entries: Vec<LogEntry>,
    /// Paired liveness tracker.
    cleaner: Arc<SegmentCleaner>,
}

impl Segment {
    /// Open a fresh segment at `base` with a new cleaner.
    pub fn open(base: LogIndex) -> Self {
        Self {
            base,
            entries: Vec::new(),
            cleaner: Arc::new(SegmentCleaner::new()),
        }
    }

    pub fn base(&self) -> LogIndex {
        self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cleaner(&self) -> &Arc<SegmentCleaner> {
        &self.cleaner
    }

    /// Relative offset of `index` within this segment, or the no-offset
    /// sentinel when the index precedes the base.
    pub fn offset_of(&self, index: LogIndex) -> i64 {
        if index < self.base {
            super::cleaner::NO_OFFSET
        } else {
            (index - self.base) as i64
        }
    }

    /// Highest index stored, or `base - 1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.base.saturating_sub(1))
    }

    /// Whether `index` could live in this segment given its base and the
    /// entries appended so far.
    pub fn covers(&self, index: LogIndex) -> bool {
        index >= self.base && index <= self.last_index()
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        // Dense until rewritten, so try direct addressing first.
        let offset = index.checked_sub(self.base)? as usize;
        match self.entries.get(offset) {
            Some(entry) if entry.index == index => Some(entry),
            _ => self
                .entries
                .binary_search_by_key(&index, |e| e.index)
                .ok()
                .map(|i| &self.entries[i]),
        }
    }

    /// Append the next entry. The caller guarantees index density.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drop every entry with index >= `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        self.entries.retain(|e| e.index < index);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Rewrite this segment, keeping only entries the point-in-time cleaner
    /// view still considers live. Surviving entries are transferred to the
    /// replacement's fresh cleaner so release hooks can carry state across.
    pub fn rewrite(&self, view: &SegmentCleaner) -> Segment {
        let replacement = Segment {
            base: self.base,
            entries: self
                .entries
                .iter()
                .filter(|e| view.is_clean(self.offset_of(e.index)))
                .cloned()
                .collect(),
            cleaner: Arc::new(SegmentCleaner::new()),
        };
        for entry in &replacement.entries {
            replacement
                .cleaner
                .transfer(replacement.offset_of(entry.index), entry);
        }
        replacement
    }

    /// Release the paired cleaner's storage. Called when the segment is
    /// compacted away or deleted.
    pub fn close(&self) {
        self.cleaner.close();
    }
}
