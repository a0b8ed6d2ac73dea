//! The segmented replicated log.
//!
//! Entries live in bounded segments, each paired with a cleaner that tracks
//! released offsets. The log enforces index density on append, answers the
//! log-matching and up-to-date checks the consensus handlers need, and
//! supports atomically replacing its prefix when a snapshot is installed.

use super::cleaner::ReleaseHook;
use super::segment::Segment;
use crate::error::{QuorumError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single entry in the replicated log.
///
/// The command payload is Arc-wrapped for O(1) cloning during replication.
/// The optional release hook is runtime-only state consumed by
/// [`SegmentCleaner::transfer`](super::cleaner::SegmentCleaner::transfer);
/// it never crosses the wire.
#[derive(Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the entry was created.
    pub term: Term,
    /// 1-based position in the log.
    pub index: LogIndex,
    /// Opaque command bytes.
    #[serde(with = "arc_bytes")]
    pub command: Arc<Vec<u8>>,
    /// Extra cleanup semantics for release tracking.
    #[serde(skip)]
    pub release: Option<ReleaseHook>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command: Arc::new(command),
            release: None,
        }
    }

    pub fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    #[inline]
    pub fn command_bytes(&self) -> &[u8] {
        &self.command
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntry")
            .field("term", &self.term)
            .field("index", &self.index)
            .field("len", &self.command.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.index == other.index && self.command == other.command
    }
}

/// Serde helper for `Arc<Vec<u8>>` payloads.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Append-only entry storage composed of segments.
#[derive(Debug)]
pub struct SegmentedLog {
    segments: Vec<Segment>,
    /// Entries per segment before a new one is rolled.
    segment_capacity: usize,
    /// Index of the first entry still present (after snapshot installs).
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, from the snapshot marker.
    snapshot_term: Term,
}

impl SegmentedLog {
    pub fn new(segment_capacity: usize) -> Self {
        Self {
            segments: vec![Segment::open(1)],
            segment_capacity: segment_capacity.max(1),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.segments
            .iter()
            .rev()
            .find(|s| !s.is_empty())
            .map(|s| s.last_index())
            .unwrap_or_else(|| self.first_index.saturating_sub(1))
    }

    pub fn last_term(&self) -> Term {
        self.get(self.last_index())
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn segment_for(&self, index: LogIndex) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| index >= s.base() && index <= s.last_index())
    }

    /// Append the next entry. Rejects non-dense indices.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(QuorumError::Log(format!(
                "expected index {}, got {}",
                expected, entry.index
            )));
        }
        let roll_base = {
            let tail = self.segments.last().expect("log always has a tail segment");
            (tail.len() >= self.segment_capacity).then(|| tail.last_index() + 1)
        };
        if let Some(base) = roll_base {
            self.segments.push(Segment::open(base));
        }
        let tail = self.segments.last_mut().expect("tail segment");
        tail.append(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.segment_for(index).and_then(|s| s.get(index))
    }

    /// Term of the entry at `index`; index 0 and the snapshot boundary are
    /// answerable without an entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index + 1 == self.first_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries from `start` (inclusive), capped at `limit`.
    pub fn entries_from(&self, start: LogIndex, limit: usize) -> Vec<LogEntry> {
        let start = start.max(self.first_index);
        let mut out = Vec::new();
        let mut index = start;
        let last = self.last_index();
        while index <= last && out.len() < limit {
            if let Some(entry) = self.get(index) {
                out.push(entry.clone());
            }
            index += 1;
        }
        out
    }

    /// Entries in the inclusive range `[start, end]`.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        if end < start {
            return Vec::new();
        }
        self.entries_from(start, (end - start + 1) as usize)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Drop every entry with index >= `index`. Only the uncommitted suffix
    /// may ever be passed here; the caller enforces that bound.
    pub fn truncate_from(&mut self, index: LogIndex) {
        for segment in &mut self.segments {
            segment.truncate_from(index);
        }
        // Drop emptied trailing segments, closing their cleaners, but keep
        // one tail to append into.
        while self.segments.len() > 1 {
            let tail = self.segments.last().expect("non-empty");
            if tail.is_empty() {
                let closed = self.segments.pop().expect("non-empty");
                closed.close();
            } else {
                break;
            }
        }
    }

    /// Log-matching check: does the entry at `prev_index` carry `prev_term`?
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        if prev_index == 0 {
            return true;
        }
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Whether a candidate's `(last_term, last_index)` is at least as
    /// up-to-date as ours, compared term first.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let our_term = self.last_term();
        if last_term != our_term {
            last_term > our_term
        } else {
            last_index >= self.last_index()
        }
    }

    /// Mark the entry at `index` as released in its owning segment's cleaner
    /// and hand the entry to it. Returns whether this call performed the
    /// release; `Ok(false)` for already-released or already-compacted
    /// entries.
    pub fn release(&self, index: LogIndex) -> Result<bool> {
        let segment = match self.segment_for(index) {
            Some(s) => s,
            None => return Ok(false),
        };
        let offset = segment.offset_of(index);
        if let Some(entry) = segment.get(index) {
            segment.cleaner().transfer(offset, entry);
        }
        segment.cleaner().clean(offset)
    }

    /// Replace the log prefix up to `index` with a snapshot marker. Every
    /// segment wholly covered is dropped along with its cleaner; entries past
    /// `index` survive. Commit/applied bookkeeping is reset by the caller.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        if index < self.first_index {
            return;
        }
        let survivors = self.entries_from(index + 1, usize::MAX);
        for segment in &self.segments {
            segment.close();
        }
        self.segments = vec![Segment::open(index + 1)];
        self.first_index = index + 1;
        self.snapshot_term = term;
        for entry in survivors {
            // Survivor indices stay dense above the marker.
            self.append(entry).expect("survivor entries remain dense");
        }
    }

    /// Replace the segment based at `base` with its rewritten form, closing
    /// the old segment and cleaner together.
    pub fn swap_segment(&mut self, base: LogIndex, replacement: Segment) {
        if let Some(slot) = self.segments.iter_mut().find(|s| s.base() == base) {
            slot.close();
            *slot = replacement;
        }
    }
}
