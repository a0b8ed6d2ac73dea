//! Quorumlog - the consensus and log-compaction core of a replicated-log server.
//!
//! Quorumlog implements leader-based replication in the Raft family: a cluster
//! of servers agrees on an ordered log of commands, applies them to a
//! deterministic state machine, and compacts the log incrementally instead of
//! rewriting it wholesale.
//!
//! # Features
//!
//! - **Five-role consensus**: Inactive, Passive, Follower, Candidate, and
//!   Leader roles over a single RPC surface, with pre-vote polling and
//!   sticky-leader vote withholding to keep elections rare.
//! - **Replicated sessions**: client session lifecycle travels through the
//!   log itself, so every member holds an identical session registry at the
//!   same applied index.
//! - **Segmented log with incremental compaction**: per-segment liveness
//!   bitmaps track released entries; dense-enough segments are rewritten in
//!   the background while the tail keeps appending.
//! - **Tunable reads**: linearizable, lease-bounded, and eventual consistency
//!   per query.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Quorumlog                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Client Ops: Command | Query | Register | KeepAlive | ...   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ConsensusServer: roles | elections | replication | commit  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SegmentedLog: segments | cleaners | snapshot boundary      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Compactor: release tracking | segment rewrite | swap       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use quorumlog::{ConsensusServer, ServerConfig, StateMachine};
//! use quorumlog::storage::{MemoryLogStore, MemoryStableStore};
//! use quorumlog::types::{ClusterConfiguration, Member};
//! use std::sync::Arc;
//!
//! struct Register(Vec<u8>);
//!
//! impl StateMachine for Register {
//!     fn apply(&mut self, command: &[u8]) -> Vec<u8> {
//!         self.0 = command.to_vec();
//!         self.0.clone()
//!     }
//!     fn query(&self, _query: &[u8]) -> Vec<u8> {
//!         self.0.clone()
//!     }
//!     fn snapshot(&self) -> Vec<u8> {
//!         self.0.clone()
//!     }
//!     fn restore(&mut self, snapshot: &[u8]) -> quorumlog::Result<()> {
//!         self.0 = snapshot.to_vec();
//!         Ok(())
//!     }
//! }
//!
//! # async fn start(transport: Arc<dyn quorumlog::protocol::Transport>) -> quorumlog::Result<()> {
//! let config = ServerConfig {
//!     node_id: 1,
//!     cluster: ClusterConfiguration::new(vec![
//!         Member::active(1, "n1:7000"),
//!         Member::active(2, "n2:7000"),
//!         Member::active(3, "n3:7000"),
//!     ]),
//!     ..Default::default()
//! };
//! let (server, commands) = ConsensusServer::new(
//!     config,
//!     Arc::new(MemoryLogStore::new()),
//!     Arc::new(MemoryStableStore::new()),
//!     Register(Vec::new()),
//!     transport,
//! )?;
//! tokio::spawn(server.run(commands));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod types;

pub use config::{CompactionConfig, ServerConfig};
pub use error::{QuorumError, Result};
pub use protocol::{LogCommand, Transport};
pub use server::{ConsensusServer, ServerCommand, StateMachine};
pub use session::SessionRegistry;
pub use state::Role;
pub use storage::{Compactor, LogEntry, LogStore, SegmentCleaner, SegmentedLog, StableStore};
pub use types::{
    ClusterConfiguration, ConsistencyLevel, LogIndex, Member, MemberKind, NodeId, SessionId, Term,
};
