//! Background segment compaction.
//!
//! The compactor runs out-of-band from the consensus loop. Each pass has two
//! phases: a mark phase that asks the state-machine collaborator whether each
//! committed entry is still required and releases the ones that are not, and
//! a sweep phase that rewrites any closed segment whose released-entry
//! density exceeds the configured threshold. A rewrite works against a
//! point-in-time `copy()` of the segment's cleaner so releases recorded
//! mid-pass are simply picked up next time.

use super::log::{LogEntry, SegmentedLog};
use super::LogStore;
use crate::config::CompactionConfig;
use crate::error::Result;
use crate::types::LogIndex;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborator deciding whether a committed entry is still required for
/// correctness or recovery.
pub trait RetentionPolicy: Send + Sync {
    fn is_required(&self, entry: &LogEntry) -> bool;
}

impl<F> RetentionPolicy for F
where
    F: Fn(&LogEntry) -> bool + Send + Sync,
{
    fn is_required(&self, entry: &LogEntry) -> bool {
        self(entry)
    }
}

/// Density-driven segment rewriter.
pub struct Compactor {
    log: Arc<RwLock<SegmentedLog>>,
    store: Arc<dyn LogStore>,
    policy: Arc<dyn RetentionPolicy>,
    /// Shared with the consensus loop; entries above this are never touched.
    commit_index: Arc<AtomicU64>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(
        log: Arc<RwLock<SegmentedLog>>,
        store: Arc<dyn LogStore>,
        policy: Arc<dyn RetentionPolicy>,
        commit_index: Arc<AtomicU64>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            log,
            store,
            policy,
            commit_index,
            config,
        }
    }

    /// Run passes until the shutdown signal fires.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once() {
                        warn!(error = %e, "compaction pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("compactor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One full mark + sweep pass. Exposed for deterministic tests.
    pub fn run_once(&self) -> Result<usize> {
        self.mark()?;
        self.sweep()
    }

    /// Release committed entries the state machine no longer needs.
    fn mark(&self) -> Result<()> {
        let commit_index = self.commit_index.load(Ordering::Acquire);
        let log = self.log.read();
        let first = log.first_index();
        for index in first..=commit_index.min(log.last_index()) {
            let required = match log.get(index) {
                Some(entry) => self.policy.is_required(entry),
                None => continue,
            };
            if !required {
                log.release(index)?;
            }
        }
        Ok(())
    }

    /// Rewrite segments whose released density exceeds the threshold.
    /// Returns the number of segments rewritten.
    fn sweep(&self) -> Result<usize> {
        let commit_index = self.commit_index.load(Ordering::Acquire);
        let candidates: Vec<(LogIndex, super::cleaner::SegmentCleaner)> = {
            let log = self.log.read();
            let segments = log.segments();
            segments
                .iter()
                .enumerate()
                // The open tail segment is never compacted.
                .filter(|(i, _)| *i + 1 < segments.len())
                .filter(|(_, s)| !s.is_empty() && s.last_index() <= commit_index)
                .filter(|(_, s)| {
                    let density = s.cleaner().count() as f64 / s.len() as f64;
                    density > self.config.rewrite_threshold
                })
                .take(self.config.max_segments_per_pass)
                .map(|(_, s)| (s.base(), s.cleaner().copy()))
                .collect()
        };

        let mut rewritten = 0;
        for (base, view) in candidates {
            let replacement = {
                let log = self.log.read();
                let segment = match log.segments().iter().find(|s| s.base() == base) {
                    Some(s) => s,
                    None => continue,
                };
                let retained: Vec<LogIndex> = segment
                    .entries()
                    .iter()
                    .filter(|e| view.is_clean(segment.offset_of(e.index)))
                    .map(|e| e.index)
                    .collect();
                self.store.rewrite_segment(base, &retained)?;
                segment.rewrite(&view)
            };
            let dropped = {
                let mut log = self.log.write();
                let before = log.len();
                log.swap_segment(base, replacement);
                before - log.len()
            };
            debug!(base, dropped, "rewrote segment");
            rewritten += 1;
        }
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;

    fn harness(
        segment_capacity: usize,
        entries: u64,
        commit: u64,
        policy: impl Fn(&LogEntry) -> bool + Send + Sync + 'static,
        config: CompactionConfig,
    ) -> (Compactor, Arc<RwLock<SegmentedLog>>) {
        let mut log = SegmentedLog::new(segment_capacity);
        for i in 1..=entries {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        let log = Arc::new(RwLock::new(log));
        let compactor = Compactor::new(
            Arc::clone(&log),
            Arc::new(MemoryLogStore::new()),
            Arc::new(policy),
            Arc::new(AtomicU64::new(commit)),
            config,
        );
        (compactor, log)
    }

    #[test]
    fn dense_segment_is_rewritten() {
        // Entries 1..=4 in the first segment; all superseded.
        let (compactor, log) = harness(
            4,
            8,
            8,
            |entry: &LogEntry| entry.index > 4,
            CompactionConfig {
                rewrite_threshold: 0.5,
                ..Default::default()
            },
        );
        let rewritten = compactor.run_once().unwrap();
        assert_eq!(rewritten, 1);
        let log = log.read();
        assert_eq!(log.len(), 4, "first segment emptied");
        assert!(log.get(2).is_none());
        assert!(log.get(5).is_some());
    }

    #[test]
    fn sparse_segment_is_left_alone() {
        let (compactor, log) = harness(
            4,
            8,
            8,
            |entry: &LogEntry| entry.index != 1,
            CompactionConfig {
                rewrite_threshold: 0.5,
                ..Default::default()
            },
        );
        // Only 1 of 4 entries released: density 0.25 stays below 0.5.
        let rewritten = compactor.run_once().unwrap();
        assert_eq!(rewritten, 0);
        assert_eq!(log.read().len(), 8);
    }

    #[test]
    fn segments_with_uncommitted_entries_are_not_swept() {
        let (compactor, log) = harness(
            4,
            8,
            3,
            |_: &LogEntry| false,
            CompactionConfig {
                rewrite_threshold: 0.0,
                ..Default::default()
            },
        );
        let rewritten = compactor.run_once().unwrap();
        // Segment 1 holds index 4, above the commit index, so it is not a
        // sweep candidate even with a retain-nothing policy.
        assert_eq!(rewritten, 0);
        let log = log.read();
        assert!(log.get(1).is_some());
        assert!(log.get(8).is_some());
    }

    #[test]
    fn fully_committed_segment_is_swept() {
        let (compactor, log) = harness(
            4,
            8,
            4,
            |_: &LogEntry| false,
            CompactionConfig {
                rewrite_threshold: 0.0,
                ..Default::default()
            },
        );
        let rewritten = compactor.run_once().unwrap();
        assert_eq!(rewritten, 1);
        let log = log.read();
        assert!(log.get(1).is_none());
        assert!(log.get(5).is_some());
    }

    #[test]
    fn tail_segment_is_never_compacted() {
        let (compactor, log) = harness(
            4,
            6,
            6,
            |_: &LogEntry| false,
            CompactionConfig {
                rewrite_threshold: 0.0,
                ..Default::default()
            },
        );
        compactor.run_once().unwrap();
        let log = log.read();
        assert!(log.get(5).is_some());
        assert!(log.get(6).is_some());
    }

    #[test]
    fn repeated_passes_are_stable() {
        let (compactor, log) = harness(
            4,
            8,
            8,
            |entry: &LogEntry| entry.index > 4,
            CompactionConfig {
                rewrite_threshold: 0.1,
                ..Default::default()
            },
        );
        compactor.run_once().unwrap();
        let after_first = log.read().len();
        compactor.run_once().unwrap();
        assert_eq!(log.read().len(), after_first);
    }
}
