//! Consensus integration tests.
//!
//! A full cluster of servers wired over an in-process transport that routes
//! every RPC into the target server's command channel, so elections,
//! replication, and sessions run exactly as they would over a network.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use quorumlog::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigurationResponse,
    InstallRequest, InstallResponse, JoinRequest, KeepAliveRequest, LeaveRequest, PollRequest,
    PollResponse, PublishRequest, PublishResponse, QueryRequest, ReconfigureRequest,
    RegisterRequest, Transport, UnregisterRequest, VoteRequest, VoteResponse,
};
use quorumlog::storage::{MemoryLogStore, MemoryStableStore};
use quorumlog::{
    ClusterConfiguration, ConsensusServer, ConsistencyLevel, Member, NodeId, QuorumError, Result,
    ServerCommand, ServerConfig, StateMachine,
};

// =============================================================================
// Test state machine
// =============================================================================

/// Counter driven by `+` / `-` commands.
#[derive(Debug, Default)]
struct CounterMachine {
    counter: i64,
}

impl StateMachine for CounterMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        match command.first() {
            Some(b'+') => self.counter += 1,
            Some(b'-') => self.counter -= 1,
            _ => {}
        }
        self.counter.to_be_bytes().to_vec()
    }

    fn query(&self, _query: &[u8]) -> Vec<u8> {
        self.counter.to_be_bytes().to_vec()
    }

    fn snapshot(&self) -> Vec<u8> {
        self.counter.to_be_bytes().to_vec()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let bytes: [u8; 8] = snapshot
            .try_into()
            .map_err(|_| QuorumError::Serialization("bad counter snapshot".into()))?;
        self.counter = i64::from_be_bytes(bytes);
        Ok(())
    }
}

fn decode_counter(bytes: &[u8]) -> i64 {
    i64::from_be_bytes(bytes.try_into().expect("counter payload"))
}

// =============================================================================
// In-process transport
// =============================================================================

async fn ask<R>(
    sender: &mpsc::Sender<ServerCommand>,
    make: impl FnOnce(oneshot::Sender<R>) -> ServerCommand,
) -> Result<R> {
    let (tx, rx) = oneshot::channel();
    sender
        .send(make(tx))
        .await
        .map_err(|_| QuorumError::Closed)?;
    rx.await.map_err(|_| QuorumError::Closed)
}

/// Routes RPCs into each server's command channel. Nodes can be taken
/// offline to simulate partitions.
#[derive(Default)]
struct LoopbackTransport {
    routes: RwLock<HashMap<NodeId, mpsc::Sender<ServerCommand>>>,
    offline: RwLock<HashSet<NodeId>>,
}

impl LoopbackTransport {
    fn set_offline(&self, node: NodeId, offline: bool) {
        if offline {
            self.offline.write().insert(node);
        } else {
            self.offline.write().remove(&node);
        }
    }

    fn route(&self, target: NodeId) -> Result<mpsc::Sender<ServerCommand>> {
        if self.offline.read().contains(&target) {
            return Err(QuorumError::Transport(format!("node {} unreachable", target)));
        }
        self.routes
            .read()
            .get(&target)
            .cloned()
            .ok_or(QuorumError::UnknownMember(target))
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn vote(&self, target: NodeId, request: VoteRequest) -> Result<VoteResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Vote { request, response }).await
    }

    async fn poll(&self, target: NodeId, request: PollRequest) -> Result<PollResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Poll { request, response }).await
    }

    async fn append(&self, target: NodeId, request: AppendRequest) -> Result<AppendResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Append { request, response }).await
    }

    async fn install(&self, target: NodeId, request: InstallRequest) -> Result<InstallResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Install { request, response }).await
    }

    async fn join(&self, target: NodeId, request: JoinRequest) -> Result<ConfigurationResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Join { request, response }).await?
    }

    async fn reconfigure(
        &self,
        target: NodeId,
        request: ReconfigureRequest,
    ) -> Result<ConfigurationResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Reconfigure { request, response }).await?
    }

    async fn leave(&self, target: NodeId, request: LeaveRequest) -> Result<ConfigurationResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Leave { request, response }).await?
    }

    async fn publish(&self, target: NodeId, request: PublishRequest) -> Result<PublishResponse> {
        let sender = self.route(target)?;
        ask(&sender, |response| ServerCommand::Publish { request, response }).await?
    }
}

// =============================================================================
// Cluster harness
// =============================================================================

struct Cluster {
    transport: Arc<LoopbackTransport>,
    senders: HashMap<NodeId, mpsc::Sender<ServerCommand>>,
}

impl Cluster {
    async fn start(size: u64) -> Self {
        let members: Vec<Member> = (1..=size)
            .map(|id| Member::active(id, format!("n{}:7000", id)))
            .collect();
        let transport = Arc::new(LoopbackTransport::default());
        let mut senders = HashMap::new();

        for id in 1..=size {
            let config = ServerConfig {
                node_id: id,
                cluster: ClusterConfiguration::new(members.clone()),
                ..Default::default()
            };
            let (server, commands) = ConsensusServer::new(
                config,
                Arc::new(MemoryLogStore::new()),
                Arc::new(MemoryStableStore::new()),
                CounterMachine::default(),
                Arc::clone(&transport) as Arc<dyn Transport>,
            )
            .expect("valid config");
            let sender = server.command_sender();
            transport.routes.write().insert(id, sender.clone());
            senders.insert(id, sender);
            tokio::spawn(server.run(commands));
        }

        Self { transport, senders }
    }

    async fn is_leader(&self, node: NodeId) -> bool {
        ask(&self.senders[&node], |response| ServerCommand::IsLeader { response })
            .await
            .unwrap_or(false)
    }

    async fn wait_for_leader(&self) -> NodeId {
        for _ in 0..400 {
            for &id in self.senders.keys() {
                if self.is_leader(id).await {
                    return id;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no leader elected within deadline");
    }

    async fn wait_for_leader_other_than(&self, old: NodeId) -> NodeId {
        for _ in 0..400 {
            for &id in self.senders.keys() {
                if id != old && self.is_leader(id).await {
                    return id;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no replacement leader elected within deadline");
    }

    async fn command(&self, node: NodeId, payload: &[u8]) -> Result<CommandResponse> {
        let request = CommandRequest {
            session_id: None,
            command: payload.to_vec(),
        };
        ask(&self.senders[&node], |response| ServerCommand::Command { request, response }).await?
    }

    async fn counter_of(&self, node: NodeId) -> i64 {
        let request = QueryRequest {
            consistency: ConsistencyLevel::Eventual,
            query: Vec::new(),
        };
        let response = ask(&self.senders[&node], |response| ServerCommand::Query {
            request,
            response,
        })
        .await
        .expect("query channel")
        .expect("eventual query always answers");
        decode_counter(&response.result)
    }

    async fn wait_for_counter(&self, node: NodeId, expected: i64) {
        for _ in 0..400 {
            if self.counter_of(node).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "node {} never reached counter {}, at {}",
            node,
            expected,
            self.counter_of(node).await
        );
    }
}

// =============================================================================
// Elections
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn five_node_cluster_elects_a_single_leader() {
    let cluster = Cluster::start(5).await;
    let leader = cluster.wait_for_leader().await;

    // Let the leader establish heartbeats, then check uniqueness.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut leaders = Vec::new();
    for &id in cluster.senders.keys() {
        if cluster.is_leader(id).await {
            leaders.push(id);
        }
    }
    assert_eq!(leaders, vec![leader], "exactly one leader survives");
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_failure_triggers_a_new_election() {
    let cluster = Cluster::start(3).await;
    let old_leader = cluster.wait_for_leader().await;

    let _ = cluster.senders[&old_leader].send(ServerCommand::Shutdown).await;
    cluster.transport.set_offline(old_leader, true);

    let new_leader = cluster.wait_for_leader_other_than(old_leader).await;
    assert_ne!(new_leader, old_leader);
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn committed_commands_apply_on_every_member() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    for _ in 0..3 {
        let response = cluster.command(leader, b"+").await.expect("command commits");
        assert!(response.index > 0);
    }
    assert_eq!(decode_counter(
        &cluster.command(leader, b"+").await.unwrap().result
    ), 4);

    for &id in cluster.senders.keys() {
        cluster.wait_for_counter(id, 4).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_redirect_commands_to_the_leader() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let follower = *cluster.senders.keys().find(|&&id| id != leader).unwrap();

    let err = cluster.command(follower, b"+").await.unwrap_err();
    match err {
        QuorumError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("expected a leader redirect, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_follower_catches_up_after_healing() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let lagging = *cluster.senders.keys().find(|&&id| id != leader).unwrap();

    cluster.transport.set_offline(lagging, true);
    for _ in 0..5 {
        cluster.command(leader, b"+").await.expect("quorum of two still commits");
    }
    assert_ne!(cluster.counter_of(lagging).await, 5);

    cluster.transport.set_offline(lagging, false);
    cluster.wait_for_counter(lagging, 5).await;
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn linearizable_queries_require_the_leader() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let follower = *cluster.senders.keys().find(|&&id| id != leader).unwrap();
    cluster.command(leader, b"+").await.unwrap();

    let request = QueryRequest {
        consistency: ConsistencyLevel::Linearizable,
        query: Vec::new(),
    };
    let response = ask(&cluster.senders[&leader], |response| ServerCommand::Query {
        request: request.clone(),
        response,
    })
    .await
    .unwrap()
    .expect("leader proves leadership with a quorum round");
    assert_eq!(decode_counter(&response.result), 1);

    let err = ask(&cluster.senders[&follower], |response| ServerCommand::Query {
        request,
        response,
    })
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, QuorumError::NotLeader { .. }));
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn session_register_keep_alive_unregister() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    let registered = ask(&cluster.senders[&leader], |response| ServerCommand::Register {
        request: RegisterRequest { timeout_ms: 10_000 },
        response,
    })
    .await
    .unwrap()
    .expect("registration commits");
    assert_eq!(registered.timeout_ms, 10_000);
    assert_eq!(registered.leader, Some(leader));

    // Commands may now carry the session.
    let request = CommandRequest {
        session_id: Some(registered.session_id),
        command: b"+".to_vec(),
    };
    ask(&cluster.senders[&leader], |response| ServerCommand::Command { request, response })
        .await
        .unwrap()
        .expect("session command commits");

    let keep_alive = ask(&cluster.senders[&leader], |response| ServerCommand::KeepAlive {
        request: KeepAliveRequest {
            session_id: registered.session_id,
            event_index: 0,
        },
        response,
    })
    .await
    .unwrap()
    .expect("keep-alive commits");
    assert_eq!(keep_alive.leader, Some(leader));

    ask(&cluster.senders[&leader], |response| ServerCommand::Unregister {
        request: UnregisterRequest {
            session_id: registered.session_id,
        },
        response,
    })
    .await
    .unwrap()
    .expect("unregister commits");

    let err = ask(&cluster.senders[&leader], |response| ServerCommand::KeepAlive {
        request: KeepAliveRequest {
            session_id: registered.session_id,
            event_index: 0,
        },
        response,
    })
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, QuorumError::SessionExpired));
}

// =============================================================================
// Membership
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn join_commits_an_expanded_configuration() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    let response = ask(&cluster.senders[&leader], |response| ServerCommand::Join {
        request: JoinRequest {
            member: Member::passive(4, "n4:7000"),
        },
        response,
    })
    .await
    .unwrap()
    .expect("configuration change commits");

    assert_eq!(response.configuration.members.len(), 4);
    assert_eq!(
        response.configuration.quorum_size(),
        2,
        "passive member does not grow the quorum"
    );

    let err = ask(&cluster.senders[&leader], |response| ServerCommand::Join {
        request: JoinRequest {
            member: Member::passive(4, "n4:7000"),
        },
        response,
    })
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, QuorumError::AlreadyMember(4)));
}
