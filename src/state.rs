//! Server role and consensus state.

use crate::types::{ClusterConfiguration, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The role a server currently plays. Handlers are dispatched on this tag at
/// call time; each role gives the same RPC surface role-specific semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not participating: shut down, failed, or not yet started.
    Inactive,
    /// Replicates the log but never votes or stands for election.
    Passive,
    /// Default participating role; responds to leaders and candidates.
    Follower,
    /// Standing for election in the current term.
    Candidate,
    /// Handles client requests and drives replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, Role::Inactive)
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, Role::Passive)
    }

    /// Whether this role may start elections and cast votes.
    pub fn is_voting(&self) -> bool {
        matches!(self, Role::Follower | Role::Candidate | Role::Leader)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Inactive => "Inactive",
            Role::Passive => "Passive",
            Role::Follower => "Follower",
            Role::Candidate => "Candidate",
            Role::Leader => "Leader",
        };
        write!(f, "{}", name)
    }
}

/// State that must survive restarts. Written through the stable store before
/// any response that depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this server has seen.
    pub current_term: Term,
    /// Candidate that received this server's vote in the current term.
    pub voted_for: Option<NodeId>,
}

/// Volatile state on all servers.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest index known committed. Non-decreasing, ≤ last log index.
    pub commit_index: LogIndex,
    /// Highest index applied to the state machine.
    pub last_applied: LogIndex,
}

/// Per-follower replication bookkeeping, valid only while leader.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next entry to send to each member.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest entry known replicated on each member.
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Followers currently receiving a streamed snapshot, by next chunk
    /// offset. One chunk in flight per follower.
    pub snapshotting: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub fn new(members: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &member in members {
            next_index.insert(member, last_log_index + 1);
            match_index.insert(member, 0);
        }
        Self {
            next_index,
            match_index,
            snapshotting: HashMap::new(),
        }
    }

    pub fn update_match(&mut self, member: NodeId, match_index: LogIndex) {
        let known = self.match_index.entry(member).or_insert(0);
        // A reordered stale ack never moves match index backwards.
        if match_index > *known {
            *known = match_index;
        }
        self.next_index.insert(member, (*known).max(match_index) + 1);
    }

    /// Back off toward the follower's hint after a log-matching failure.
    pub fn back_off(&mut self, member: NodeId, hint_index: LogIndex) {
        self.next_index.insert(member, hint_index.max(1));
    }
}

/// Complete mutable consensus state for one server, owned by the event loop.
#[derive(Debug)]
pub struct ServerState {
    pub node_id: NodeId,
    pub role: Role,
    /// Last known leader, for client redirects.
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Present only while leader.
    pub leader: Option<LeaderState>,
    /// Committed cluster configuration.
    pub cluster: ClusterConfiguration,
    /// Index of an appended but uncommitted configuration entry, if any.
    pub pending_configuration: Option<LogIndex>,
}

impl ServerState {
    pub fn new(node_id: NodeId, cluster: ClusterConfiguration) -> Self {
        Self {
            node_id,
            role: Role::Inactive,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            cluster,
            pending_configuration: None,
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Step down into Follower, adopting `term` if it is newer. The vote is
    /// cleared on every term change.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        debug_assert!(term >= self.persistent.current_term);
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term,
            leader = ?leader_id,
            "became follower"
        );
    }

    /// Start an election: advance the term and vote for self.
    pub fn become_candidate(&mut self) {
        debug_assert!(self.role.is_voting());
        self.role = Role::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id);
        let members: Vec<NodeId> = self
            .cluster
            .member_ids()
            .into_iter()
            .filter(|&id| id != self.node_id)
            .collect();
        self.leader = Some(LeaderState::new(&members, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    pub fn become_passive(&mut self) {
        self.role = Role::Passive;
        self.leader = None;
        tracing::info!(node_id = self.node_id, "became passive");
    }

    /// Shut down or fail. Terminal until the server is restarted.
    pub fn become_inactive(&mut self) {
        self.role = Role::Inactive;
        self.leader_id = None;
        self.leader = None;
        tracing::info!(node_id = self.node_id, "became inactive");
    }

    /// Advance the commit index. Never moves backwards and the caller
    /// guarantees it does not exceed the last log index.
    pub fn advance_commit(&mut self, index: LogIndex) {
        debug_assert!(index >= self.volatile.commit_index);
        if index > self.volatile.commit_index {
            self.volatile.commit_index = index;
        }
    }

    /// Highest index replicated on a quorum of the voting configuration,
    /// counting the leader's own log.
    pub fn quorum_match_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader_state = match &self.leader {
            Some(l) => l,
            None => return self.volatile.commit_index,
        };
        let mut indices: Vec<LogIndex> = self
            .cluster
            .active_ids()
            .into_iter()
            .map(|id| {
                if id == self.node_id {
                    last_log_index
                } else {
                    leader_state.match_index.get(&id).copied().unwrap_or(0)
                }
            })
            .collect();
        indices.sort_unstable();
        indices.reverse();

        let quorum_idx = self.cluster.quorum_size() - 1;
        indices.get(quorum_idx).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Member;

    fn cluster_of(n: u64) -> ClusterConfiguration {
        ClusterConfiguration::new(
            (1..=n)
                .map(|id| Member::active(id, format!("n{}:1", id)))
                .collect(),
        )
    }

    #[test]
    fn startup_is_inactive() {
        let state = ServerState::new(1, cluster_of(3));
        assert!(state.role.is_inactive());
        assert_eq!(state.current_term(), 0);
    }

    #[test]
    fn candidate_votes_for_self() {
        let mut state = ServerState::new(1, cluster_of(3));
        state.become_follower(0, None);
        state.become_candidate();
        assert!(state.role.is_candidate());
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn higher_term_clears_vote() {
        let mut state = ServerState::new(1, cluster_of(3));
        state.become_follower(0, None);
        state.become_candidate();
        assert_eq!(state.persistent.voted_for, Some(1));
        state.become_follower(5, Some(2));
        assert_eq!(state.current_term(), 5);
        assert_eq!(state.persistent.voted_for, None);
        assert_eq!(state.leader_id, Some(2));
    }

    #[test]
    fn same_term_step_down_keeps_vote() {
        let mut state = ServerState::new(1, cluster_of(3));
        state.become_follower(0, None);
        state.become_candidate();
        let term = state.current_term();
        state.become_follower(term, Some(3));
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn leader_initializes_replication_state() {
        let mut state = ServerState::new(1, cluster_of(3));
        state.become_follower(0, None);
        state.become_candidate();
        state.become_leader(5);
        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&6));
        assert_eq!(leader.match_index.get(&2), Some(&0));
        assert!(!leader.next_index.contains_key(&1), "leader excludes itself");
    }

    #[test]
    fn match_index_never_regresses() {
        let mut leader = LeaderState::new(&[2, 3], 0);
        leader.update_match(2, 7);
        leader.update_match(2, 3);
        assert_eq!(leader.match_index.get(&2), Some(&7));
        assert_eq!(leader.next_index.get(&2), Some(&8));
    }

    #[test]
    fn quorum_match_over_five_members() {
        let mut state = ServerState::new(1, cluster_of(5));
        state.become_follower(0, None);
        state.become_candidate();
        state.become_leader(10);
        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);
        // Sorted descending with the leader's 10: [10, 9, 8, 7, 6]; the
        // third highest is what three of five hold.
        assert_eq!(state.quorum_match_index(10), 8);
    }

    #[test]
    fn quorum_match_ignores_passive_members() {
        let mut cluster = cluster_of(3);
        cluster.members.push(Member::passive(4, "n4:1"));
        cluster.members.push(Member::passive(5, "n5:1"));
        let mut state = ServerState::new(1, cluster);
        state.become_follower(0, None);
        state.become_candidate();
        state.become_leader(4);
        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 4);
        leader.match_index.insert(3, 0);
        // Passive members fully caught up must not count toward quorum.
        leader.match_index.insert(4, 4);
        leader.match_index.insert(5, 4);
        assert_eq!(state.quorum_match_index(4), 4);
    }
}
