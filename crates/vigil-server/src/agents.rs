//! Agent registry: which connection owns which agent type, and allocation
//! of the talker sequence numbers that identify queries pushed to an agent.

use std::collections::HashMap;

use tracing::{debug, warn};

use vigil_protocol::RegisterCode;

use crate::connection::ConnId;

/// Registry of connected agents.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    by_type: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
    next_seq: HashMap<ConnId, u16>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn_id` as the agent for `agent_type`. Only one
    /// connection may own a type; a second registration is rejected.
    pub fn register(&mut self, agent_type: &str, conn_id: ConnId) -> RegisterCode {
        if let Some(owner) = self.by_type.get(agent_type) {
            warn!(agent_type, owner, conn_id, "agent type already registered");
            return RegisterCode::Rejected;
        }
        if self.by_conn.contains_key(&conn_id) {
            // One registration per connection keeps talker routing
            // unambiguous.
            warn!(conn_id, "connection already registered as an agent");
            return RegisterCode::Rejected;
        }
        self.by_type.insert(agent_type.to_owned(), conn_id);
        self.by_conn.insert(conn_id, agent_type.to_owned());
        self.next_seq.insert(conn_id, 0);
        debug!(agent_type, conn_id, "agent registered");
        RegisterCode::Done
    }

    /// The connection owning `agent_type`, if any.
    #[must_use]
    pub fn agent_for(&self, agent_type: &str) -> Option<ConnId> {
        self.by_type.get(agent_type).copied()
    }

    /// Free a dying connection's agent type. Returns the type it owned.
    pub fn unregister(&mut self, conn_id: ConnId) -> Option<String> {
        let agent_type = self.by_conn.remove(&conn_id)?;
        self.by_type.remove(&agent_type);
        self.next_seq.remove(&conn_id);
        debug!(agent_type = %agent_type, conn_id, "agent unregistered");
        Some(agent_type)
    }

    /// Allocate a talker sequence number on an agent connection, skipping
    /// values still tied to in-flight queries.
    pub fn alloc_talker_seq(
        &mut self,
        conn_id: ConnId,
        mut in_use: impl FnMut(u16) -> bool,
    ) -> Option<u16> {
        let next = self.next_seq.get_mut(&conn_id)?;
        for _ in 0..=u16::MAX {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
