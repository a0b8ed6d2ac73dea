//! The consensus server.
//!
//! One server owns its entire consensus state and processes everything
//! through a single event loop: RPCs arriving from peers, client operations,
//! the leader's heartbeat interval, and the election deadline all funnel into
//! one `tokio::select!`. Handlers therefore never race each other; background
//! work (compaction) touches only structures designed for it.

use crate::config::ServerConfig;
use crate::error::{QuorumError, Result};
use crate::protocol::*;
use crate::session::SessionRegistry;
use crate::state::{Role, ServerState};
use crate::storage::{LogEntry, LogStore, SegmentedLog, StableStore};
use crate::types::{
    ClusterConfiguration, ConsistencyLevel, LogIndex, Member, MemberKind, NodeId, SessionId, Term,
};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Replicated state machine the log drives. Commands are applied in log
/// order on every member; queries never mutate.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command, returning its result bytes.
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Answer a read-only query against current state.
    fn query(&self, query: &[u8]) -> Vec<u8>;

    /// Serialize current state for snapshot transfer.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace current state from a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// Everything the event loop can be asked to do.
pub enum ServerCommand {
    Vote {
        request: VoteRequest,
        response: oneshot::Sender<VoteResponse>,
    },
    Poll {
        request: PollRequest,
        response: oneshot::Sender<PollResponse>,
    },
    Append {
        request: AppendRequest,
        response: oneshot::Sender<AppendResponse>,
    },
    Install {
        request: InstallRequest,
        response: oneshot::Sender<InstallResponse>,
    },
    Join {
        request: JoinRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    },
    Reconfigure {
        request: ReconfigureRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    },
    Leave {
        request: LeaveRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    },
    Command {
        request: CommandRequest,
        response: oneshot::Sender<Result<CommandResponse>>,
    },
    Query {
        request: QueryRequest,
        response: oneshot::Sender<Result<QueryResponse>>,
    },
    Register {
        request: RegisterRequest,
        response: oneshot::Sender<Result<RegisterResponse>>,
    },
    KeepAlive {
        request: KeepAliveRequest,
        response: oneshot::Sender<Result<KeepAliveResponse>>,
    },
    Unregister {
        request: UnregisterRequest,
        response: oneshot::Sender<Result<()>>,
    },
    Connect {
        request: ConnectRequest,
        response: oneshot::Sender<Result<()>>,
    },
    Accept {
        request: AcceptRequest,
        response: oneshot::Sender<Result<()>>,
    },
    /// Inbound event batch for a session connected through this server.
    Publish {
        request: PublishRequest,
        response: oneshot::Sender<Result<PublishResponse>>,
    },
    /// Queue events produced on this server for a session.
    PublishEvents {
        session_id: SessionId,
        events: Vec<SessionEvent>,
        response: oneshot::Sender<Result<LogIndex>>,
    },
    IsLeader {
        response: oneshot::Sender<bool>,
    },
    GetLeader {
        response: oneshot::Sender<Option<NodeId>>,
    },
    GetRole {
        response: oneshot::Sender<Role>,
    },
    Shutdown,
}

/// Snapshot mid-transfer on the receiving side. One chunk in flight; chunks
/// must arrive in byte order.
#[derive(Debug)]
struct PendingSnapshot {
    data: Vec<u8>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    next_offset: u64,
}

/// Completion waiting on a log index to commit and apply.
enum Pending {
    Command(oneshot::Sender<Result<CommandResponse>>),
    Configuration(oneshot::Sender<Result<ConfigurationResponse>>),
    Register {
        session_id: SessionId,
        timeout_ms: u64,
        response: oneshot::Sender<Result<RegisterResponse>>,
    },
    KeepAlive(oneshot::Sender<Result<KeepAliveResponse>>),
    Unregister(oneshot::Sender<Result<()>>),
}

pub struct ConsensusServer<S: StateMachine> {
    config: ServerConfig,
    state: Arc<RwLock<ServerState>>,
    log: Arc<RwLock<SegmentedLog>>,
    log_store: Arc<dyn LogStore>,
    stable: Arc<dyn StableStore>,
    state_machine: Arc<RwLock<S>>,
    sessions: Arc<RwLock<SessionRegistry>>,
    transport: Arc<dyn Transport>,
    command_tx: mpsc::Sender<ServerCommand>,
    /// Commit index mirror shared with the compactor.
    commit_index: Arc<AtomicU64>,
    pending_snapshot: Arc<RwLock<Option<PendingSnapshot>>>,
    /// Completions keyed by the log index they wait on.
    pending: Arc<RwLock<Vec<(LogIndex, Pending)>>>,
    /// Last append accepted from a valid leader, for vote withholding.
    last_leader_contact: Arc<RwLock<Option<Instant>>>,
    /// Last round where a quorum of followers answered, bounding the lease.
    last_quorum_contact: Arc<RwLock<Option<Instant>>>,
}

impl<S: StateMachine + 'static> ConsensusServer<S> {
    pub fn new(
        config: ServerConfig,
        log_store: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        state_machine: S,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<ServerCommand>)> {
        config.validate()?;

        let mut state = ServerState::new(config.node_id, config.cluster.clone());
        if let Some(persistent) = stable.load()? {
            state.persistent = persistent;
        }

        let log = SegmentedLog::new(config.segment_capacity);
        let (command_tx, command_rx) = mpsc::channel(1024);

        let server = Self {
            config,
            state: Arc::new(RwLock::new(state)),
            log: Arc::new(RwLock::new(log)),
            log_store,
            stable,
            state_machine: Arc::new(RwLock::new(state_machine)),
            sessions: Arc::new(RwLock::new(SessionRegistry::new())),
            transport,
            command_tx,
            commit_index: Arc::new(AtomicU64::new(0)),
            pending_snapshot: Arc::new(RwLock::new(None)),
            pending: Arc::new(RwLock::new(Vec::new())),
            last_leader_contact: Arc::new(RwLock::new(None)),
            last_quorum_contact: Arc::new(RwLock::new(None)),
        };
        Ok((server, command_rx))
    }

    pub fn command_sender(&self) -> mpsc::Sender<ServerCommand> {
        self.command_tx.clone()
    }

    /// Commit index mirror for wiring up a [`crate::storage::Compactor`].
    pub fn commit_index_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.commit_index)
    }

    pub fn log_handle(&self) -> Arc<RwLock<SegmentedLog>> {
        Arc::clone(&self.log)
    }

    /// Run the event loop until shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<ServerCommand>) {
        self.activate();
        let mut election_deadline = self.next_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);

        loop {
            let (is_leader, holds_elections) = {
                let state = self.state.read();
                (
                    state.is_leader(),
                    state.role.is_voting() && !state.is_leader(),
                )
            };

            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        ServerCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "server shutting down");
                            self.state.write().become_inactive();
                            break;
                        }
                        ServerCommand::Vote { request, response } => {
                            let _ = response.send(self.handle_vote(request));
                        }
                        ServerCommand::Poll { request, response } => {
                            let _ = response.send(self.handle_poll(request));
                        }
                        ServerCommand::Append { request, response } => {
                            let request_term = request.term;
                            let result = self.handle_append(request);
                            // Any append accepted at the current term is
                            // leader contact, even when log matching fails
                            // during back-off.
                            if result.term == request_term {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        ServerCommand::Install { request, response } => {
                            let result = self.handle_install(request);
                            if result.accepted {
                                election_deadline = self.next_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        ServerCommand::Join { request, response } => {
                            self.handle_join(request, response).await;
                        }
                        ServerCommand::Reconfigure { request, response } => {
                            self.handle_reconfigure(request, response).await;
                        }
                        ServerCommand::Leave { request, response } => {
                            self.handle_leave(request, response).await;
                        }
                        ServerCommand::Command { request, response } => {
                            self.handle_command(request, response).await;
                        }
                        ServerCommand::Query { request, response } => {
                            let result = self.handle_query(request).await;
                            let _ = response.send(result);
                        }
                        ServerCommand::Register { request, response } => {
                            self.handle_register(request, response).await;
                        }
                        ServerCommand::KeepAlive { request, response } => {
                            self.handle_keep_alive(request, response).await;
                        }
                        ServerCommand::Unregister { request, response } => {
                            self.handle_unregister(request, response).await;
                        }
                        ServerCommand::Connect { request, response } => {
                            let result = self
                                .sessions
                                .write()
                                .connect(request.session_id, request.connection_id);
                            let _ = response.send(result);
                        }
                        ServerCommand::Accept { request, response } => {
                            let result = self.sessions.write().accept(
                                request.session_id,
                                request.connection_id,
                                request.address,
                            );
                            let _ = response.send(result);
                        }
                        ServerCommand::Publish { request, response } => {
                            let _ = response.send(self.handle_publish(request));
                        }
                        ServerCommand::PublishEvents { session_id, events, response } => {
                            let result = self.sessions.write().queue_events(session_id, events);
                            let _ = response.send(result);
                        }
                        ServerCommand::IsLeader { response } => {
                            let _ = response.send(self.state.read().is_leader());
                        }
                        ServerCommand::GetLeader { response } => {
                            let _ = response.send(self.state.read().leader_id);
                        }
                        ServerCommand::GetRole { response } => {
                            let _ = response.send(self.state.read().role);
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.expire_sessions();
                    self.replicate_to_all().await;
                    self.deliver_pending_events().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if holds_elections => {
                    self.start_election().await;
                    election_deadline = self.next_election_deadline();
                }

                else => break,
            }

            self.apply_committed_entries();
        }
    }

    /// Startup transition out of Inactive, according to this server's own
    /// membership kind.
    fn activate(&self) {
        let mut state = self.state.write();
        let kind = state
            .cluster
            .get(self.config.node_id)
            .map(|m| m.kind)
            .unwrap_or(MemberKind::Passive);
        let term = state.current_term();
        match kind {
            MemberKind::Active => state.become_follower(term, None),
            MemberKind::Passive => state.become_passive(),
        }
    }

    fn next_election_deadline(&self) -> Instant {
        let mut rng = rand::thread_rng();
        let timeout =
            rng.gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }

    /// Whether a valid leader has been heard from recently enough that votes
    /// should be withheld from other candidates.
    fn leader_is_fresh(&self) -> bool {
        self.last_leader_contact
            .read()
            .map(|at| at.elapsed() < self.config.election_timeout_min)
            .unwrap_or(false)
    }

    /// Persist term and vote; on failure the server goes Inactive, because a
    /// vote or term it cannot remember across a restart is unsafe to act on.
    fn persist_hard_state(&self, state: &mut ServerState) -> Result<()> {
        if let Err(e) = self.stable.save(&state.persistent) {
            error!(error = %e, "failed to persist term and vote, going inactive");
            state.become_inactive();
            return Err(QuorumError::Inactive);
        }
        Ok(())
    }

    fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        // Passive and inactive servers never vote.
        if !state.role.is_voting() {
            return VoteResponse {
                term: state.current_term(),
                vote_granted: false,
            };
        }

        // A known live leader makes this candidacy a disruption; refuse
        // without even adopting the higher term.
        if self.leader_is_fresh() && state.leader_id != Some(request.candidate_id) {
            debug!(
                node_id = state.node_id,
                candidate = request.candidate_id,
                "withholding vote, current leader is fresh"
            );
            return VoteResponse {
                term: state.current_term(),
                vote_granted: false,
            };
        }

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            if self.persist_hard_state(&mut state).is_err() {
                return VoteResponse {
                    term: state.current_term(),
                    vote_granted: false,
                };
            }
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            if self.persist_hard_state(&mut state).is_err() {
                return VoteResponse {
                    term: state.current_term(),
                    vote_granted: false,
                };
            }
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled vote request"
        );

        VoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Pre-vote probe: answers exactly as a vote would, but mutates nothing.
    fn handle_poll(&self, request: PollRequest) -> PollResponse {
        let state = self.state.read();
        let log = self.log.read();

        let vote_would_be_granted = if !state.role.is_voting() {
            false
        } else if self.leader_is_fresh() && state.leader_id != Some(request.candidate_id) {
            false
        } else if request.term < state.current_term() {
            false
        } else if request.term == state.current_term()
            && state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else {
            log.is_up_to_date(request.last_log_index, request.last_log_term)
        };

        PollResponse {
            term: state.current_term(),
            vote_would_be_granted,
        }
    }

    fn handle_append(&self, request: AppendRequest) -> AppendResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if state.role.is_inactive() {
            return AppendResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                hint_index: 0,
            };
        }

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            if self.persist_hard_state(&mut state).is_err() {
                return AppendResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: 0,
                    hint_index: 0,
                };
            }
        }

        if request.term < state.current_term() {
            return AppendResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                hint_index: log.last_index() + 1,
            };
        }

        // Same term: a candidate (or a stale leader) yields to the
        // established leader.
        if state.role.is_candidate() || (state.is_leader() && request.leader_id != state.node_id) {
            state.become_follower(request.term, Some(request.leader_id));
        }
        state.leader_id = Some(request.leader_id);
        *self.last_leader_contact.write() = Some(Instant::now());

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            // Tell the leader the highest index we can guarantee: the first
            // index of the conflicting term, or just past our log when we
            // have no entry there at all.
            let hint_index = match log.term_at(request.prev_log_index) {
                Some(conflict_term) => {
                    let mut idx = request.prev_log_index;
                    while idx > log.first_index() && log.term_at(idx - 1) == Some(conflict_term) {
                        idx -= 1;
                    }
                    idx
                }
                None => log.last_index() + 1,
            };

            return AppendResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                hint_index,
            };
        }

        // Collect genuinely new entries, truncating a conflicting suffix.
        let last_covered_index = request.prev_log_index + request.entries.len() as u64;
        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= log.last_index() {
                match log.get(entry.index) {
                    Some(existing) if existing.term == entry.term => continue,
                    _ => {
                        // A conflict below the commit index would rewrite a
                        // committed entry; the matching rules exclude it.
                        debug_assert!(entry.index > state.volatile.commit_index);
                        log.truncate_from(entry.index);
                        if let Err(e) = self.log_store.truncate_from(entry.index) {
                            error!(error = %e, "failed durable truncate, going inactive");
                            state.become_inactive();
                            return AppendResponse {
                                term: state.current_term(),
                                success: false,
                                match_index: 0,
                                hint_index: 0,
                            };
                        }
                        new_entries.push(entry);
                    }
                }
            } else {
                new_entries.push(entry);
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.log_store.append_entries(&new_entries) {
                error!(error = %e, "failed durable append, going inactive");
                state.become_inactive();
                return AppendResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: 0,
                    hint_index: 0,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "in-memory append failed after durable write");
                    state.become_inactive();
                    return AppendResponse {
                        term: state.current_term(),
                        success: false,
                        match_index: 0,
                        hint_index: 0,
                    };
                }
            }
        }

        if request.leader_commit > state.volatile.commit_index {
            // Cap at the last index this request covered. Anything beyond it
            // is a local tail the leader has not confirmed and may yet
            // overwrite.
            let commit = request.leader_commit.min(last_covered_index);
            if commit > state.volatile.commit_index {
                state.advance_commit(commit);
                self.commit_index.store(commit, Ordering::Release);
            }
        }

        AppendResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            hint_index: 0,
        }
    }

    fn handle_install(&self, request: InstallRequest) -> InstallResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            if self.persist_hard_state(&mut state).is_err() {
                return InstallResponse {
                    term: state.current_term(),
                    accepted: false,
                    next_offset: 0,
                };
            }
        }

        if request.term < state.current_term() || state.role.is_inactive() {
            return InstallResponse {
                term: state.current_term(),
                accepted: false,
                next_offset: 0,
            };
        }

        state.leader_id = Some(request.leader_id);
        *self.last_leader_contact.write() = Some(Instant::now());

        let mut pending = self.pending_snapshot.write();
        if request.offset == 0 {
            *pending = Some(PendingSnapshot {
                data: Vec::new(),
                snapshot_index: request.snapshot_index,
                snapshot_term: request.snapshot_term,
                next_offset: 0,
            });
        }

        let snapshot = match pending.as_mut() {
            Some(s) => s,
            None => {
                warn!("snapshot chunk with no transfer in progress");
                return InstallResponse {
                    term: state.current_term(),
                    accepted: false,
                    next_offset: 0,
                };
            }
        };

        if request.offset != snapshot.next_offset {
            warn!(
                expected = snapshot.next_offset,
                received = request.offset,
                "snapshot chunk out of order"
            );
            return InstallResponse {
                term: state.current_term(),
                accepted: false,
                next_offset: snapshot.next_offset,
            };
        }

        snapshot.data.extend_from_slice(&request.data);
        snapshot.next_offset += request.data.len() as u64;
        let next_offset = snapshot.next_offset;

        if request.complete {
            let snapshot_index = snapshot.snapshot_index;
            let snapshot_term = snapshot.snapshot_term;
            let data = std::mem::take(&mut snapshot.data);
            *pending = None;

            info!(
                node_id = state.node_id,
                snapshot_index,
                size = data.len(),
                "received complete snapshot"
            );

            if let Err(e) = self.state_machine.write().restore(&data) {
                error!(error = %e, "failed to restore state machine from snapshot");
                return InstallResponse {
                    term: state.current_term(),
                    accepted: false,
                    next_offset: 0,
                };
            }

            self.log
                .write()
                .reset_to_snapshot(snapshot_index, snapshot_term);
            state.volatile.commit_index = snapshot_index;
            state.volatile.last_applied = snapshot_index;
            self.commit_index.store(snapshot_index, Ordering::Release);
        }

        InstallResponse {
            term: state.current_term(),
            accepted: true,
            next_offset,
        }
    }

    /// Leader-only guard shared by client-facing handlers.
    fn require_leader(&self) -> Result<Term> {
        let state = self.state.read();
        match state.role {
            Role::Leader => Ok(state.current_term()),
            Role::Inactive => Err(QuorumError::Inactive),
            _ => Err(QuorumError::NotLeader {
                leader: state.leader_id,
            }),
        }
    }

    /// Durably append one command entry to the leader's own log.
    fn append_as_leader(&self, command: &LogCommand) -> Result<LogIndex> {
        let term = self.require_leader()?;
        let data = command.encode()?;
        let mut log = self.log.write();
        let index = log.last_index() + 1;
        let entry = LogEntry::new(term, index, data);
        if let Err(e) = self.log_store.append_entries(std::slice::from_ref(&entry)) {
            error!(error = %e, "failed durable append, going inactive");
            self.state.write().become_inactive();
            return Err(QuorumError::Inactive);
        }
        log.append(entry)?;
        Ok(index)
    }

    async fn handle_command(
        &self,
        request: CommandRequest,
        response: oneshot::Sender<Result<CommandResponse>>,
    ) {
        if let Some(session_id) = request.session_id {
            if self.sessions.read().get(session_id).is_none() {
                let _ = response.send(Err(QuorumError::SessionExpired));
                return;
            }
        }
        let command = LogCommand::Command {
            session_id: request.session_id,
            command: request.command,
        };
        match self.append_as_leader(&command) {
            Ok(index) => {
                self.pending.write().push((index, Pending::Command(response)));
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        match request.consistency {
            ConsistencyLevel::Eventual => {
                let index = self.state.read().volatile.commit_index;
                let result = self.state_machine.read().query(&request.query);
                Ok(QueryResponse { index, result })
            }
            ConsistencyLevel::LeaseBounded => {
                self.require_leader()?;
                let lease_valid = self
                    .last_quorum_contact
                    .read()
                    .map(|at| at.elapsed() < self.config.election_timeout_min)
                    .unwrap_or(false);
                if !lease_valid {
                    return Err(QuorumError::NoLeader);
                }
                let index = self.state.read().volatile.commit_index;
                let result = self.state_machine.read().query(&request.query);
                Ok(QueryResponse { index, result })
            }
            ConsistencyLevel::Linearizable => {
                self.require_leader()?;
                // Confirm leadership with a live quorum round before reading.
                let acked = self.replicate_to_all().await;
                let quorum = self.state.read().cluster.quorum_size();
                if acked < quorum || !self.state.read().is_leader() {
                    return Err(QuorumError::NotLeader {
                        leader: self.state.read().leader_id,
                    });
                }
                let index = self.state.read().volatile.commit_index;
                let result = self.state_machine.read().query(&request.query);
                Ok(QueryResponse { index, result })
            }
        }
    }

    async fn handle_join(
        &self,
        request: JoinRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    ) {
        if self.state.read().cluster.contains(request.member.id) {
            let _ = response.send(Err(QuorumError::AlreadyMember(request.member.id)));
            return;
        }
        let mut members = self.state.read().cluster.members.clone();
        members.push(request.member);
        self.propose_configuration(members, response).await;
    }

    async fn handle_reconfigure(
        &self,
        request: ReconfigureRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    ) {
        if !self.state.read().cluster.contains(request.member.id) {
            let _ = response.send(Err(QuorumError::UnknownMember(request.member.id)));
            return;
        }
        let mut members = self.state.read().cluster.members.clone();
        for existing in &mut members {
            if existing.id == request.member.id {
                *existing = request.member.clone();
            }
        }
        self.propose_configuration(members, response).await;
    }

    async fn handle_leave(
        &self,
        request: LeaveRequest,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    ) {
        if !self.state.read().cluster.contains(request.node_id) {
            let _ = response.send(Err(QuorumError::UnknownMember(request.node_id)));
            return;
        }
        let members = self
            .state
            .read()
            .cluster
            .members
            .iter()
            .filter(|m| m.id != request.node_id)
            .cloned()
            .collect();
        self.propose_configuration(members, response).await;
    }

    /// Append a configuration-change entry. At most one may be uncommitted;
    /// the new configuration takes effect when it commits.
    async fn propose_configuration(
        &self,
        members: Vec<Member>,
        response: oneshot::Sender<Result<ConfigurationResponse>>,
    ) {
        let term = match self.require_leader() {
            Ok(term) => term,
            Err(e) => {
                let _ = response.send(Err(e));
                return;
            }
        };
        if self.state.read().pending_configuration.is_some() {
            let _ = response.send(Err(QuorumError::ConfigurationInProgress));
            return;
        }

        let mut configuration = ClusterConfiguration::new(members);
        configuration.term = term;
        configuration.index = self.log.read().last_index() + 1;

        match self.append_as_leader(&LogCommand::Configure(configuration)) {
            Ok(index) => {
                self.state.write().pending_configuration = Some(index);
                self.pending
                    .write()
                    .push((index, Pending::Configuration(response)));
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    async fn handle_register(
        &self,
        request: RegisterRequest,
        response: oneshot::Sender<Result<RegisterResponse>>,
    ) {
        let session_id = SessionId::new();
        let timeout_ms = request
            .timeout_ms
            .min(self.config.default_session_timeout.as_millis() as u64);
        let command = LogCommand::Register {
            session_id,
            timeout_ms,
        };
        match self.append_as_leader(&command) {
            Ok(index) => {
                self.pending.write().push((
                    index,
                    Pending::Register {
                        session_id,
                        timeout_ms,
                        response,
                    },
                ));
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    async fn handle_keep_alive(
        &self,
        request: KeepAliveRequest,
        response: oneshot::Sender<Result<KeepAliveResponse>>,
    ) {
        if self.sessions.read().get(request.session_id).is_none() {
            let _ = response.send(Err(QuorumError::SessionExpired));
            return;
        }
        let command = LogCommand::KeepAlive {
            session_id: request.session_id,
            event_index: request.event_index,
        };
        match self.append_as_leader(&command) {
            Ok(index) => {
                self.pending
                    .write()
                    .push((index, Pending::KeepAlive(response)));
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    async fn handle_unregister(
        &self,
        request: UnregisterRequest,
        response: oneshot::Sender<Result<()>>,
    ) {
        if self.sessions.read().get(request.session_id).is_none() {
            let _ = response.send(Err(QuorumError::SessionExpired));
            return;
        }
        let command = LogCommand::Unregister {
            session_id: request.session_id,
        };
        match self.append_as_leader(&command) {
            Ok(index) => {
                self.pending
                    .write()
                    .push((index, Pending::Unregister(response)));
                self.replicate_to_all().await;
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    /// Inbound event batch for a session connected through this server.
    /// Replies with the highest batch index the client holds, which doubles
    /// as the resend point on a gap.
    fn handle_publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get(request.session_id)
            .ok_or(QuorumError::SessionExpired)?
            .event_index;
        if request.previous_index != current {
            return Ok(PublishResponse {
                event_index: current,
            });
        }
        sessions.acknowledge(request.session_id, request.event_index)?;
        Ok(PublishResponse {
            event_index: request.event_index,
        })
    }

    /// Propose unregistration for sessions whose timeout has elapsed. The
    /// registries mutate only when those entries commit, so every member
    /// drops the session at the same applied index.
    fn expire_sessions(&self) {
        let stale = self.sessions.read().stale(std::time::Instant::now());
        for session_id in stale {
            info!(session = %session_id, "session timed out, proposing unregister");
            if let Err(e) = self.append_as_leader(&LogCommand::Unregister { session_id }) {
                warn!(error = %e, "failed to propose session expiry");
                return;
            }
        }
    }

    /// Push pending event batches to the servers holding each session's
    /// connection.
    async fn deliver_pending_events(&self) {
        let deliveries = {
            let sessions = self.sessions.read();
            let state = self.state.read();
            self.collect_deliveries(&sessions, &state)
        };

        for (target, request) in deliveries {
            let session_id = request.session_id;
            match self.transport.publish(target, request).await {
                Ok(resp) => {
                    let _ = self
                        .sessions
                        .write()
                        .acknowledge(session_id, resp.event_index);
                }
                Err(e) => {
                    debug!(error = %e, session = %session_id, "event delivery failed");
                }
            }
        }
    }

    fn collect_deliveries(
        &self,
        sessions: &SessionRegistry,
        state: &ServerState,
    ) -> Vec<(NodeId, PublishRequest)> {
        let mut out = Vec::new();
        for session_id in sessions.ids_with_pending() {
            let Some(address) = sessions
                .get(session_id)
                .and_then(|s| s.connection())
                .and_then(|c| c.address.clone())
            else {
                continue;
            };
            let Some(member) = state.cluster.members.iter().find(|m| m.address == address) else {
                continue;
            };
            if let Some((index, previous, events)) = sessions.next_batch(session_id) {
                out.push((
                    member.id,
                    PublishRequest {
                        session_id,
                        event_index: index,
                        previous_index: previous,
                        events: events.to_vec(),
                    },
                ));
            }
        }
        out
    }

    async fn start_election(&self) {
        // Pre-vote: probe at term + 1 without disturbing anyone's state. A
        // partitioned server keeps probing instead of inflating terms.
        let (poll_term, last_log_index, last_log_term, quorum, voters) = {
            let state = self.state.read();
            if !state.role.is_voting() || state.is_leader() {
                return;
            }
            let log = self.log.read();
            (
                state.current_term() + 1,
                log.last_index(),
                log.last_term(),
                state.cluster.quorum_size(),
                state
                    .cluster
                    .active_ids()
                    .into_iter()
                    .filter(|&id| id != self.config.node_id)
                    .collect::<Vec<_>>(),
            )
        };

        let poll = PollRequest {
            term: poll_term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let poll_futures: Vec<_> = voters
            .iter()
            .map(|&peer| {
                let transport = Arc::clone(&self.transport);
                let request = poll.clone();
                async move {
                    match timeout(Duration::from_millis(100), transport.poll(peer, request)).await
                    {
                        Ok(Ok(response)) => Some(response),
                        _ => None,
                    }
                }
            })
            .collect();
        let poll_results = futures::future::join_all(poll_futures).await;
        let promised = 1 + poll_results
            .iter()
            .flatten()
            .filter(|r| r.vote_would_be_granted)
            .count();
        if promised < quorum {
            debug!(
                node_id = self.config.node_id,
                promised, quorum, "poll round failed, not standing"
            );
            return;
        }

        // Real election.
        let term = {
            let mut state = self.state.write();
            state.become_candidate();
            if self.persist_hard_state(&mut state).is_err() {
                return;
            }
            state.current_term()
        };

        info!(node_id = self.config.node_id, term, "starting election");

        let request = VoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let vote_futures: Vec<_> = voters
            .iter()
            .map(|&peer| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    match timeout(Duration::from_millis(100), transport.vote(peer, request)).await
                    {
                        Ok(Ok(response)) => Some((peer, response)),
                        _ => None,
                    }
                }
            })
            .collect();
        let results = futures::future::join_all(vote_futures).await;

        let mut votes = 1;
        let mut won = false;
        {
            let mut state = self.state.write();
            if !state.role.is_candidate() || state.current_term() != term {
                return;
            }
            for (peer, response) in results.into_iter().flatten() {
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    let _ = self.persist_hard_state(&mut state);
                    return;
                }
                if response.vote_granted {
                    votes += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer,
                        votes,
                        "vote received"
                    );
                }
            }
            if votes >= quorum {
                let last_index = self.log.read().last_index();
                state.become_leader(last_index);
                won = true;
            }
        }

        if won {
            // Establish the commit point for this term with a no-op entry.
            if self.append_as_leader(&LogCommand::Noop).is_err() {
                return;
            }
            self.replicate_to_all().await;
        }
    }

    /// One replication round to every other member. Returns how many members
    /// (counting this one) acknowledged, which linearizable reads use as a
    /// leadership proof.
    async fn replicate_to_all(&self) -> usize {
        let (term, commit_index, targets) = {
            let state = self.state.read();
            if !state.is_leader() {
                return 0;
            }
            let leader_state = match &state.leader {
                Some(l) => l,
                None => return 0,
            };
            let targets: Vec<(NodeId, LogIndex)> = state
                .cluster
                .member_ids()
                .into_iter()
                .filter(|&id| id != self.config.node_id)
                .map(|id| (id, leader_state.next_index.get(&id).copied().unwrap_or(1)))
                .collect();
            (state.current_term(), state.volatile.commit_index, targets)
        };

        // Followers that fell behind the first retained index need the
        // snapshot stream; everyone else gets entries.
        let mut snapshot_acks = 0;
        let mut append_futures = Vec::new();
        for (peer, next_index) in targets {
            if next_index < self.log.read().first_index() {
                if self.stream_snapshot_to(peer, term).await {
                    snapshot_acks += 1;
                }
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries = log.entries_from(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let transport = Arc::clone(&self.transport);
            append_futures.push(async move {
                match timeout(Duration::from_millis(50), transport.append(peer, request)).await {
                    Ok(Ok(response)) => Some((peer, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(append_futures).await;

        let mut acked = 1 + snapshot_acks;
        {
            let mut state = self.state.write();
            if !state.is_leader() {
                return 0;
            }

            for (peer, response) in results.into_iter().flatten() {
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    let _ = self.persist_hard_state(&mut state);
                    return 0;
                }
                acked += 1;
                if let Some(leader) = state.leader.as_mut() {
                    if response.success {
                        leader.update_match(peer, response.match_index);
                    } else {
                        leader.back_off(peer, response.hint_index);
                    }
                }
            }

            // Commit what a quorum now holds, but only entries from the
            // current term (earlier terms commit transitively).
            let last_log_index = self.log.read().last_index();
            let quorum_index = state.quorum_match_index(last_log_index);
            if quorum_index > state.volatile.commit_index
                && self.log.read().term_at(quorum_index) == Some(state.current_term())
            {
                state.advance_commit(quorum_index);
                self.commit_index.store(quorum_index, Ordering::Release);
                debug!(
                    node_id = state.node_id,
                    commit_index = quorum_index,
                    "advanced commit index"
                );
            }

            if acked >= state.cluster.quorum_size() {
                *self.last_quorum_contact.write() = Some(Instant::now());
            }
        }
        acked
    }

    /// Stream the full snapshot to a follower that fell behind the log's
    /// first index. Returns whether the transfer completed.
    async fn stream_snapshot_to(&self, peer: NodeId, term: Term) -> bool {
        let data = self.state_machine.read().snapshot();
        let (snapshot_index, snapshot_term) = {
            let log = self.log.read();
            let index = log.first_index().saturating_sub(1);
            (index, log.term_at(index).unwrap_or(0))
        };
        let chunk_size = self.config.snapshot_chunk_size;

        info!(
            node_id = self.config.node_id,
            follower = peer,
            size = data.len(),
            "streaming snapshot"
        );

        let mut offset = 0u64;
        loop {
            let end = ((offset as usize) + chunk_size).min(data.len());
            let complete = end >= data.len();
            let request = InstallRequest {
                term,
                leader_id: self.config.node_id,
                snapshot_index,
                snapshot_term,
                offset,
                data: data[offset as usize..end].to_vec(),
                complete,
            };

            match timeout(
                Duration::from_secs(10),
                self.transport.install(peer, request),
            )
            .await
            {
                Ok(Ok(response)) => {
                    if response.term > term {
                        let mut state = self.state.write();
                        state.become_follower(response.term, None);
                        let _ = self.persist_hard_state(&mut state);
                        return false;
                    }
                    if !response.accepted {
                        offset = response.next_offset;
                        continue;
                    }
                    if complete {
                        let mut state = self.state.write();
                        if let Some(leader) = state.leader.as_mut() {
                            leader.update_match(peer, snapshot_index);
                        }
                        info!(follower = peer, "snapshot stream complete");
                        return true;
                    }
                    offset = response.next_offset;
                }
                _ => {
                    debug!(follower = peer, "snapshot chunk send failed");
                    return false;
                }
            }
        }
    }

    /// Apply entries between last_applied and commit_index, in order,
    /// completing any operations waiting on them.
    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = {
            let log = self.log.read();
            log.entries_range(last_applied + 1, commit_index)
        };

        for entry in entries {
            self.apply_entry(&entry);
            self.state.write().volatile.last_applied = entry.index;
        }
    }

    fn apply_entry(&self, entry: &LogEntry) {
        let command = match LogCommand::decode(entry.command_bytes()) {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, index = entry.index, "undecodable log entry");
                return;
            }
        };

        match command {
            LogCommand::Noop | LogCommand::SnapshotMarker { .. } => {}
            LogCommand::Command { command, .. } => {
                let result = self.state_machine.write().apply(&command);
                let index = entry.index;
                self.complete_pending(index, move |pending| match pending {
                    Pending::Command(tx) => {
                        let _ = tx.send(Ok(CommandResponse {
                            index,
                            result: result.clone(),
                        }));
                    }
                    other => Self::fail_pending(other),
                });
            }
            LogCommand::Configure(configuration) => {
                let term = {
                    let mut state = self.state.write();
                    info!(
                        node_id = state.node_id,
                        index = entry.index,
                        members = configuration.members.len(),
                        "configuration committed"
                    );
                    state.cluster = configuration.clone();
                    if state.pending_configuration == Some(entry.index) {
                        state.pending_configuration = None;
                    }
                    // A server no longer in the configuration stops
                    // participating entirely.
                    if !configuration.contains(self.config.node_id) {
                        state.become_inactive();
                    } else if let Some(member) = configuration.get(self.config.node_id) {
                        match (member.kind, state.role) {
                            (MemberKind::Passive, Role::Follower | Role::Candidate) => {
                                state.become_passive()
                            }
                            (MemberKind::Active, Role::Passive) => {
                                let term = state.current_term();
                                let leader = state.leader_id;
                                state.become_follower(term, leader);
                            }
                            _ => {}
                        }
                    }
                    state.current_term()
                };
                self.complete_pending(entry.index, move |pending| match pending {
                    Pending::Configuration(tx) => {
                        let _ = tx.send(Ok(ConfigurationResponse {
                            term,
                            configuration: configuration.clone(),
                        }));
                    }
                    other => Self::fail_pending(other),
                });
            }
            LogCommand::Register {
                session_id,
                timeout_ms,
            } => {
                self.sessions.write().register(
                    session_id,
                    Duration::from_millis(timeout_ms),
                    std::time::Instant::now(),
                );
                let (leader, members) = {
                    let state = self.state.read();
                    (state.leader_id, state.cluster.members.clone())
                };
                self.complete_pending(entry.index, move |pending| match pending {
                    Pending::Register {
                        session_id,
                        timeout_ms,
                        response,
                    } => {
                        let _ = response.send(Ok(RegisterResponse {
                            session_id,
                            timeout_ms,
                            leader,
                            members: members.clone(),
                        }));
                    }
                    other => Self::fail_pending(other),
                });
            }
            LogCommand::KeepAlive {
                session_id,
                event_index,
            } => {
                let alive = self
                    .sessions
                    .write()
                    .keep_alive(session_id, event_index, std::time::Instant::now())
                    .is_ok();
                let (term, leader, members) = {
                    let state = self.state.read();
                    (
                        state.current_term(),
                        state.leader_id,
                        state.cluster.members.clone(),
                    )
                };
                self.complete_pending(entry.index, move |pending| match pending {
                    Pending::KeepAlive(tx) => {
                        let _ = tx.send(if alive {
                            Ok(KeepAliveResponse {
                                term,
                                leader,
                                members: members.clone(),
                            })
                        } else {
                            Err(QuorumError::SessionExpired)
                        });
                    }
                    other => Self::fail_pending(other),
                });
            }
            LogCommand::Unregister { session_id } => {
                let removed = self.sessions.write().unregister(session_id).is_ok();
                self.complete_pending(entry.index, move |pending| match pending {
                    Pending::Unregister(tx) => {
                        let _ = tx.send(if removed {
                            Ok(())
                        } else {
                            Err(QuorumError::SessionExpired)
                        });
                    }
                    other => Self::fail_pending(other),
                });
            }
        }
    }

    fn complete_pending<F>(&self, index: LogIndex, complete: F)
    where
        F: Fn(Pending),
    {
        let mut pending = self.pending.write();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].0 == index {
                let (_, completion) = pending.swap_remove(i);
                complete(completion);
            } else {
                i += 1;
            }
        }
    }

    /// A completion whose entry applied as a different kind than expected
    /// can only mean the index was reused after a truncation; the caller's
    /// operation is gone.
    fn fail_pending(pending: Pending) {
        match pending {
            Pending::Command(tx) => {
                let _ = tx.send(Err(QuorumError::Closed));
            }
            Pending::Configuration(tx) => {
                let _ = tx.send(Err(QuorumError::Closed));
            }
            Pending::Register { response, .. } => {
                let _ = response.send(Err(QuorumError::Closed));
            }
            Pending::KeepAlive(tx) => {
                let _ = tx.send(Err(QuorumError::Closed));
            }
            Pending::Unregister(tx) => {
                let _ = tx.send(Err(QuorumError::Closed));
            }
        }
    }
}
