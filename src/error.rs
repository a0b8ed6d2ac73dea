//! Error types for the consensus core.
//!
//! A single [`QuorumError`] covers every failure the core can report, with a
//! [`Result`] alias used throughout. Errors fall into three classes:
//!
//! - **Retryable protocol conditions**: stale terms, missing or changed
//!   leaders, a configuration change already in flight. Callers update their
//!   view and retry.
//! - **Programming errors**: invalid arguments such as a negative cleaner
//!   offset. Surfaced immediately, never retried.
//! - **Fatal conditions**: a durable write that cannot be guaranteed. The
//!   server transitions to inactive rather than risk violating
//!   committed-entry permanence.

use crate::types::NodeId;
use thiserror::Error;

/// Main error type for consensus operations.
#[derive(Error, Debug)]
pub enum QuorumError {
    /// The operation requires the leader; the hint names the last known one.
    #[error("not the leader; leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// No leader is currently known; the caller should retry elsewhere.
    #[error("no known leader")]
    NoLeader,

    /// The request carried a term older than the receiver's.
    #[error("stale term: observed {observed}, current {current}")]
    StaleTerm { observed: u64, current: u64 },

    /// A configuration change is already pending; only one may be in flight.
    #[error("configuration change in progress")]
    ConfigurationInProgress,

    /// The named member is not part of the current configuration.
    #[error("unknown member: {0}")]
    UnknownMember(NodeId),

    /// The member is already part of the current configuration.
    #[error("member already joined: {0}")]
    AlreadyMember(NodeId),

    /// The session has expired or was never registered.
    #[error("unknown or expired session")]
    SessionExpired,

    /// The session has no bound connection for event delivery.
    #[error("session has no connection")]
    SessionNotConnected,

    /// The server has shut down or failed; it no longer serves requests.
    #[error("server is inactive")]
    Inactive,

    /// A durable write failed. Fatal for this server instance.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Negative or otherwise invalid offset passed to a cleaner operation.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// Log invariant violation (non-dense append, bad truncation target).
    #[error("log error: {0}")]
    Log(String),

    /// Invalid configuration value.
    #[error("invalid config: {field}: {reason}")]
    Config { field: String, reason: String },

    /// Transport-level failure reaching a peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The server's command channel is closed.
    #[error("server closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QuorumError {
    /// Whether a caller may reasonably retry after observing this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuorumError::NotLeader { .. }
                | QuorumError::NoLeader
                | QuorumError::StaleTerm { .. }
                | QuorumError::ConfigurationInProgress
                | QuorumError::Transport(_)
                | QuorumError::Timeout
        )
    }

    /// Whether this error is fatal for the server instance that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QuorumError::Storage(_))
    }
}

impl From<bincode::Error> for QuorumError {
    fn from(err: bincode::Error) -> Self {
        QuorumError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QuorumError {
    fn from(err: std::io::Error) -> Self {
        QuorumError::Storage(err.to_string())
    }
}

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, QuorumError>;
