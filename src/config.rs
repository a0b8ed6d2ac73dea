//! Server and compaction configuration.

use crate::error::{QuorumError, Result};
use crate::types::{ClusterConfiguration, NodeId};
use std::time::Duration;

/// Configuration for a consensus server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This server's ID. Must appear in the initial cluster configuration.
    pub node_id: NodeId,
    /// Initial cluster membership.
    pub cluster: ClusterConfiguration,
    /// Minimum randomized election timeout. Also bounds the sticky-leader
    /// window and the leader read lease.
    pub election_timeout_min: Duration,
    /// Maximum randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum entries per Append batch.
    pub max_entries_per_append: usize,
    /// Snapshot chunk size for Install streaming.
    pub snapshot_chunk_size: usize,
    /// Session timeout granted to clients that do not request one.
    pub default_session_timeout: Duration,
    /// Entries per log segment before the log rolls a new one.
    pub segment_capacity: usize,
    /// Compaction settings.
    pub compaction: CompactionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster: ClusterConfiguration::default(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_chunk_size: 1024 * 1024,
            default_session_timeout: Duration::from_secs(30),
            segment_capacity: 1024,
            compaction: CompactionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(QuorumError::Config {
                field: "node_id".to_string(),
                reason: "node id must be non-zero".to_string(),
            });
        }
        if !self.cluster.contains(self.node_id) {
            return Err(QuorumError::Config {
                field: "cluster".to_string(),
                reason: format!("node {} is not in the configuration", self.node_id),
            });
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(QuorumError::Config {
                field: "election_timeout_min".to_string(),
                reason: "must be strictly less than election_timeout_max".to_string(),
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(QuorumError::Config {
                field: "heartbeat_interval".to_string(),
                reason: "must be less than election_timeout_min".to_string(),
            });
        }
        if self.segment_capacity == 0 {
            return Err(QuorumError::Config {
                field: "segment_capacity".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        self.compaction.validate()?;
        Ok(())
    }
}

/// Settings for the background segment-compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// How often the pass scans segments.
    pub scan_interval: Duration,
    /// Released-entry density above which a segment is rewritten.
    pub rewrite_threshold: f64,
    /// Maximum segments rewritten per pass.
    pub max_segments_per_pass: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            rewrite_threshold: 0.5,
            max_segments_per_pass: 4,
        }
    }
}

impl CompactionConfig {
    /// Rewrite eagerly; useful for space-constrained deployments.
    pub fn aggressive() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            rewrite_threshold: 0.25,
            max_segments_per_pass: 16,
        }
    }

    /// Rewrite rarely; trades disk space for rewrite I/O.
    pub fn conservative() -> Self {
        Self {
            scan_interval: Duration::from_secs(600),
            rewrite_threshold: 0.75,
            max_segments_per_pass: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rewrite_threshold) {
            return Err(QuorumError::Config {
                field: "compaction.rewrite_threshold".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.max_segments_per_pass == 0 {
            return Err(QuorumError::Config {
                field: "compaction.max_segments_per_pass".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
