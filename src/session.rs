//! Client session registry.
//!
//! Sessions exist so clients can receive events and so the cluster can agree
//! on which clients are alive. Lifecycle mutations (register, keep-alive,
//! unregister) arrive here only through committed log entries, which keeps
//! every member's registry identical at the same applied index. Connection
//! bindings are local routing state and are not replicated.

use crate::error::{QuorumError, Result};
use crate::protocol::SessionEvent;
use crate::types::{LogIndex, SessionId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where a session's events are routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: u64,
    /// Address of the server holding the connection, once accepted.
    pub address: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub timeout: Duration,
    /// Instant of the last committed keep-alive (or registration).
    last_contact: Instant,
    /// Binding established by Connect, completed by Accept.
    connection: Option<Connection>,
    /// Highest event index the client has acknowledged.
    pub event_index: LogIndex,
    /// Index assigned to the most recently queued batch.
    next_event_index: LogIndex,
    /// Batches not yet acknowledged, oldest first.
    pending: Vec<(LogIndex, Vec<SessionEvent>)>,
}

impl Session {
    fn new(id: SessionId, timeout: Duration, now: Instant) -> Self {
        Self {
            id,
            timeout,
            last_contact: now,
            connection: None,
            event_index: 0,
            next_event_index: 0,
            pending: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_contact) > self.timeout
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }
}

/// All live sessions on one server.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Apply a committed registration.
    pub fn register(&mut self, id: SessionId, timeout: Duration, now: Instant) {
        debug!(session = %id, ?timeout, "session registered");
        self.sessions.insert(id, Session::new(id, timeout, now));
    }

    /// Apply a committed keep-alive. Acknowledged event batches are dropped.
    pub fn keep_alive(&mut self, id: SessionId, event_index: LogIndex, now: Instant) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(QuorumError::SessionExpired)?;
        session.last_contact = now;
        if event_index > session.event_index {
            session.event_index = event_index;
            session.pending.retain(|(index, _)| *index > event_index);
        }
        Ok(())
    }

    /// Apply a committed unregister.
    pub fn unregister(&mut self, id: SessionId) -> Result<()> {
        self.sessions
            .remove(&id)
            .map(|_| debug!(session = %id, "session unregistered"))
            .ok_or(QuorumError::SessionExpired)
    }

    /// Bind a session to the connection the client opened. Local state only.
    pub fn connect(&mut self, id: SessionId, connection_id: u64) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(QuorumError::SessionExpired)?;
        session.connection = Some(Connection {
            connection_id,
            address: None,
        });
        Ok(())
    }

    /// Record which server accepted the session's connection.
    pub fn accept(&mut self, id: SessionId, connection_id: u64, address: String) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(QuorumError::SessionExpired)?;
        match &mut session.connection {
            Some(conn) if conn.connection_id == connection_id => {
                conn.address = Some(address);
                Ok(())
            }
            _ => Err(QuorumError::SessionNotConnected),
        }
    }

    /// Queue an event batch for delivery. Fails when the session has never
    /// connected, since there is nowhere to route the batch.
    pub fn queue_events(&mut self, id: SessionId, events: Vec<SessionEvent>) -> Result<LogIndex> {
        let session = self.sessions.get_mut(&id).ok_or(QuorumError::SessionExpired)?;
        if session.connection.is_none() {
            return Err(QuorumError::SessionNotConnected);
        }
        session.next_event_index += 1;
        let index = session.next_event_index;
        session.pending.push((index, events));
        Ok(index)
    }

    /// Oldest unacknowledged batch for a session, with the index of the batch
    /// preceding it for gap detection.
    pub fn next_batch(&self, id: SessionId) -> Option<(LogIndex, LogIndex, &[SessionEvent])> {
        let session = self.sessions.get(&id)?;
        let (index, events) = session.pending.first()?;
        Some((*index, session.event_index, events.as_slice()))
    }

    /// Record a publish acknowledgment. The client reports the highest batch
    /// index it holds; anything at or below is dropped from the queue.
    pub fn acknowledge(&mut self, id: SessionId, event_index: LogIndex) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(QuorumError::SessionExpired)?;
        if event_index > session.event_index {
            session.event_index = event_index;
        }
        session.pending.retain(|(index, _)| *index > event_index);
        Ok(())
    }

    /// Sessions that have at least one undelivered event batch.
    pub fn ids_with_pending(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| !s.pending.is_empty())
            .map(|s| s.id)
            .collect()
    }

    /// Sessions whose timeout has elapsed, without removing them. The leader
    /// uses this to propose unregistrations; removal happens when those
    /// entries commit.
    pub fn stale(&self, now: Instant) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id)
            .collect();
        for id in &stale {
            debug!(session = %id, "session expired");
        }
        stale
    }
}
