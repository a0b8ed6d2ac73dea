//! Wire protocol message definitions.
//!
//! Request/response pairs for every server-to-server and client-facing
//! operation, plus the [`Transport`] seam the server sends through. The
//! actual wire codec lives behind the transport implementation.

use crate::storage::LogEntry;
use crate::types::{
    ClusterConfiguration, ConsistencyLevel, LogIndex, Member, NodeId, SessionId, Term,
};
use serde::{Deserialize, Serialize};

/// Every message that can cross the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Vote(VoteRequest),
    VoteResponse(VoteResponse),
    Poll(PollRequest),
    PollResponse(PollResponse),
    Append(AppendRequest),
    AppendResponse(AppendResponse),
    Install(InstallRequest),
    InstallResponse(InstallResponse),
    Join(JoinRequest),
    Reconfigure(ReconfigureRequest),
    Leave(LeaveRequest),
    ConfigurationResponse(ConfigurationResponse),
    Publish(PublishRequest),
    PublishResponse(PublishResponse),
}

/// Vote request sent by a candidate after winning a poll round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Receiver's current term, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
}

/// Pre-vote probe. Identical inputs to [`VoteRequest`] but the receiver
/// answers without mutating its persisted term or vote, so a partitioned
/// server cannot bump terms cluster-wide by polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    /// Term the candidate would campaign at.
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub term: Term,
    /// Whether a real vote at this term would be granted.
    pub vote_would_be_granted: bool,
}

/// Log replication and heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    /// Leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    /// Whether the receiver's log matched at `prev_log_index`.
    pub success: bool,
    /// Highest index now replicated on the receiver; valid when `success`.
    pub match_index: LogIndex,
    /// On failure, the highest index the receiver can guarantee: the first
    /// index of the conflicting term, or last index + 1 for a short log.
    pub hint_index: LogIndex,
}

/// One snapshot chunk. Chunks are streamed in byte order with a single chunk
/// in flight per follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// The snapshot covers the log through this index.
    pub snapshot_index: LogIndex,
    /// Term of the entry at `snapshot_index`.
    pub snapshot_term: Term,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Set on the final chunk.
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResponse {
    pub term: Term,
    /// Whether the chunk landed at the expected offset.
    pub accepted: bool,
    /// Byte offset the receiver expects next. On an offset mismatch this is
    /// where the leader must resume.
    pub next_offset: u64,
}

/// Request to add a server to the cluster, sent to the leader by the joining
/// server itself or on its behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

/// Request to change an existing member's kind or address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub member: Member,
}

/// Request to remove a server from the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub node_id: NodeId,
}

/// Shared response for the three configuration-change requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub term: Term,
    /// The configuration now in effect (committed).
    pub configuration: ClusterConfiguration,
}

/// Client command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Session the command belongs to, when the client registered one.
    pub session_id: Option<SessionId>,
    #[serde(with = "serde_bytes")]
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Log index the command committed at.
    pub index: LogIndex,
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
}

/// Client read. Never appends to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub consistency: ConsistencyLevel,
    #[serde(with = "serde_bytes")]
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Commit index the read was served at.
    pub index: LogIndex,
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
}

/// Open a new client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Requested session timeout in milliseconds; the server may lower it.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub session_id: SessionId,
    /// Granted timeout in milliseconds.
    pub timeout_ms: u64,
    pub leader: Option<NodeId>,
    pub members: Vec<Member>,
}

/// Session heartbeat. Also acknowledges received events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: SessionId,
    /// Highest event index the client has received.
    pub event_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub term: Term,
    pub leader: Option<NodeId>,
    pub members: Vec<Member>,
}

/// Close a session explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session_id: SessionId,
}

/// Event batch pushed from a server to a connected session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub session_id: SessionId,
    /// Index of this batch.
    pub event_index: LogIndex,
    /// Index of the previous batch, for gap detection.
    pub previous_index: LogIndex,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Highest event index the client holds; on a gap, where to resend from.
    pub event_index: LogIndex,
}

/// A single published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Bind a session to the transport connection the client opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    pub connection_id: u64,
}

/// Server-side acknowledgment routing a session's events through the
/// accepting server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub session_id: SessionId,
    pub connection_id: u64,
    /// Address of the server now holding the connection.
    pub address: String,
}

/// Commands as they are encoded into log entries. Everything that mutates
/// replicated state, including session lifecycle, flows through here so it
/// reaches every member in log order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogCommand {
    /// Leader's first entry in a new term; commits nothing but establishes
    /// the leader's commit point.
    Noop,
    /// Opaque state machine command.
    Command {
        session_id: Option<SessionId>,
        #[serde(with = "serde_bytes")]
        command: Vec<u8>,
    },
    /// Cluster membership change.
    Configure(ClusterConfiguration),
    /// Session registration.
    Register {
        session_id: SessionId,
        timeout_ms: u64,
    },
    /// Session heartbeat.
    KeepAlive {
        session_id: SessionId,
        event_index: LogIndex,
    },
    /// Session close.
    Unregister { session_id: SessionId },
    /// Placeholder left at the snapshot boundary after an install.
    SnapshotMarker { index: LogIndex, term: Term },
}

impl LogCommand {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Transport seam for server-to-server traffic and event push. One in-flight
/// request per call; timeouts and retries belong to the caller.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn vote(&self, target: NodeId, request: VoteRequest) -> crate::Result<VoteResponse>;

    async fn poll(&self, target: NodeId, request: PollRequest) -> crate::Result<PollResponse>;

    async fn append(&self, target: NodeId, request: AppendRequest)
        -> crate::Result<AppendResponse>;

    async fn install(
        &self,
        target: NodeId,
        request: InstallRequest,
    ) -> crate::Result<InstallResponse>;

    async fn join(
        &self,
        target: NodeId,
        request: JoinRequest,
    ) -> crate::Result<ConfigurationResponse>;

    async fn reconfigure(
        &self,
        target: NodeId,
        request: ReconfigureRequest,
    ) -> crate::Result<ConfigurationResponse>;

    async fn leave(
        &self,
        target: NodeId,
        request: LeaveRequest,
    ) -> crate::Result<ConfigurationResponse>;

    /// Push an event batch to the server holding the session's connection.
    async fn publish(
        &self,
        target: NodeId,
        request: PublishRequest,
    ) -> crate::Result<PublishResponse>;
}

/// In-memory transport for tests: per-node handler functions.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::QuorumError;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Handler = Box<dyn Fn(ProtocolMessage) -> ProtocolMessage + Send + Sync>;

    pub struct MockTransport {
        handlers: Arc<Mutex<HashMap<NodeId, Handler>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                handlers: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        pub async fn register_handler<F>(&self, node_id: NodeId, handler: F)
        where
            F: Fn(ProtocolMessage) -> ProtocolMessage + Send + Sync + 'static,
        {
            self.handlers.lock().await.insert(node_id, Box::new(handler));
        }

        async fn dispatch(
            &self,
            target: NodeId,
            message: ProtocolMessage,
        ) -> crate::Result<ProtocolMessage> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(QuorumError::UnknownMember(target))?;
            Ok(handler(message))
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn vote(
            &self,
            target: NodeId,
            request: VoteRequest,
        ) -> crate::Result<VoteResponse> {
            match self.dispatch(target, ProtocolMessage::Vote(request)).await? {
                ProtocolMessage::VoteResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn poll(
            &self,
            target: NodeId,
            request: PollRequest,
        ) -> crate::Result<PollResponse> {
            match self.dispatch(target, ProtocolMessage::Poll(request)).await? {
                ProtocolMessage::PollResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn append(
            &self,
            target: NodeId,
            request: AppendRequest,
        ) -> crate::Result<AppendResponse> {
            match self
                .dispatch(target, ProtocolMessage::Append(request))
                .await?
            {
                ProtocolMessage::AppendResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn install(
            &self,
            target: NodeId,
            request: InstallRequest,
        ) -> crate::Result<InstallResponse> {
            match self
                .dispatch(target, ProtocolMessage::Install(request))
                .await?
            {
                ProtocolMessage::InstallResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn join(
            &self,
            target: NodeId,
            request: JoinRequest,
        ) -> crate::Result<ConfigurationResponse> {
            match self.dispatch(target, ProtocolMessage::Join(request)).await? {
                ProtocolMessage::ConfigurationResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn reconfigure(
            &self,
            target: NodeId,
            request: ReconfigureRequest,
        ) -> crate::Result<ConfigurationResponse> {
            match self
                .dispatch(target, ProtocolMessage::Reconfigure(request))
                .await?
            {
                ProtocolMessage::ConfigurationResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn leave(
            &self,
            target: NodeId,
            request: LeaveRequest,
        ) -> crate::Result<ConfigurationResponse> {
            match self
                .dispatch(target, ProtocolMessage::Leave(request))
                .await?
            {
                ProtocolMessage::ConfigurationResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }

        async fn publish(
            &self,
            target: NodeId,
            request: PublishRequest,
        ) -> crate::Result<PublishResponse> {
            match self
                .dispatch(target, ProtocolMessage::Publish(request))
                .await?
            {
                ProtocolMessage::PublishResponse(resp) => Ok(resp),
                _ => Err(QuorumError::Transport("unexpected response".into())),
            }
        }
    }
}
