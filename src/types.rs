//! Core type definitions shared across the consensus core.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: cluster member identifier
//! - [`Term`] = `u64`: logical epoch ordering leadership
//! - [`LogIndex`] = `u64`: 1-based, dense log position
//! - [`SessionId`]: uuid-backed client session identifier

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a cluster member.
pub type NodeId = u64;

/// Raft term number. Strictly non-decreasing on every server.
pub type Term = u64;

/// Position in the replicated log. Indices are 1-based; 0 means "before the
/// first entry".
pub type LogIndex = u64;

/// Unique identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a member votes and counts toward quorum, or only replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Voting member: participates in elections and commit quorums.
    Active,
    /// Non-voting member: replicates the log but never votes or leads.
    Passive,
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: String,
    pub kind: MemberKind,
}

impl Member {
    pub fn active(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Active,
        }
    }

    pub fn passive(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Passive,
        }
    }

    pub fn is_active(&self) -> bool {
        self.kind == MemberKind::Active
    }
}

/// The cluster membership, versioned by the log position that created it.
///
/// A configuration takes effect only once the entry carrying it commits; at
/// most one configuration change may be pending at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Index of the log entry that introduced this configuration.
    pub index: LogIndex,
    /// Term of the log entry that introduced this configuration.
    pub term: Term,
    /// Ordered member set.
    pub members: Vec<Member>,
}

impl ClusterConfiguration {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            index: 0,
            term: 0,
            members,
        }
    }

    /// Voting member ids.
    pub fn active_ids(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.id)
            .collect()
    }

    /// All member ids, voting or not.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Votes needed to win an election or commit an entry: a majority of the
    /// voting members.
    pub fn quorum_size(&self) -> usize {
        let voters = self.members.iter().filter(|m| m.is_active()).count();
        voters / 2 + 1
    }
}

/// Read consistency requested by a Query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Leader confirms current leadership with a quorum round before reading.
    Linearizable,
    /// Leader serves the read under its election-timeout lease.
    LeaseBounded,
    /// Any replica serves the read from local state.
    Eventual,
}
