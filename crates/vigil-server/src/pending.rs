//! The table of checks suspended on an agent round-trip.
//!
//! An entry is created when a plugin answers "ask the agent" and lives
//! until the agent replies, the client cancels, the client disconnects, or
//! the agent disconnects. It is indexed both by the client side
//! `(connection, sequence number)` — for cancellation — and by the talker
//! side `(agent connection, talker sequence)` — for routing the agent's
//! reply back.

use std::collections::HashMap;

use vigil_core::types::{PolicyKey, PolicyType};

use crate::connection::ConnId;

/// One suspended check.
#[derive(Debug, Clone)]
pub struct PendingCheck {
    pub key: PolicyKey,
    pub client_conn: ConnId,
    pub client_seq: u16,
    pub agent_conn: ConnId,
    pub talker_seq: u16,
    pub plugin_type: PolicyType,
    /// Set once the client cancelled or disconnected; the entry then only
    /// waits for the agent before being dropped.
    pub cancelled: bool,
}

/// All currently suspended checks.
#[derive(Debug, Default)]
pub struct PendingRequests {
    by_talker: HashMap<(ConnId, u16), PendingCheck>,
    by_client: HashMap<(ConnId, u16), (ConnId, u16)>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this client connection already has a live check under `seq`.
    #[must_use]
    pub fn contains_client(&self, client_conn: ConnId, client_seq: u16) -> bool {
        self.by_client.contains_key(&(client_conn, client_seq))
    }

    /// Whether this talker sequence is still tied to a query.
    #[must_use]
    pub fn contains_talker(&self, agent_conn: ConnId, talker_seq: u16) -> bool {
        self.by_talker.contains_key(&(agent_conn, talker_seq))
    }

    /// Record a suspension. Returns `false` (and stores nothing) if either
    /// index slot is taken.
    pub fn insert(&mut self, check: PendingCheck) -> bool {
        let client_key = (check.client_conn, check.client_seq);
        let talker_key = (check.agent_conn, check.talker_seq);
        if self.by_client.contains_key(&client_key) || self.by_talker.contains_key(&talker_key) {
            return false;
        }
        self.by_client.insert(client_key, talker_key);
        self.by_talker.insert(talker_key, check);
        true
    }

    #[must_use]
    pub fn get_by_client(&self, client_conn: ConnId, client_seq: u16) -> Option<&PendingCheck> {
        let talker_key = self.by_client.get(&(client_conn, client_seq))?;
        self.by_talker.get(talker_key)
    }

    #[must_use]
    pub fn get_by_talker(&self, agent_conn: ConnId, talker_seq: u16) -> Option<&PendingCheck> {
        self.by_talker.get(&(agent_conn, talker_seq))
    }

    /// Mark the check cancelled (by its client key). Returns the entry as
    /// it was before the flag was set.
    pub fn cancel(&mut self, client_conn: ConnId, client_seq: u16) -> Option<PendingCheck> {
        let talker_key = *self.by_client.get(&(client_conn, client_seq))?;
        let entry = self.by_talker.get_mut(&talker_key)?;
        let before = entry.clone();
        entry.cancelled = true;
        Some(before)
    }

    /// Drop a check by its talker key.
    pub fn remove_by_talker(&mut self, agent_conn: ConnId, talker_seq: u16) -> Option<PendingCheck> {
        let check = self.by_talker.remove(&(agent_conn, talker_seq))?;
        self.by_client.remove(&(check.client_conn, check.client_seq));
        Some(check)
    }

    /// Cancel every check a disconnecting client left behind, returning the
    /// ones that were still live (their agents need CANCEL pushes).
    pub fn cancel_for_client(&mut self, client_conn: ConnId) -> Vec<PendingCheck> {
        let talker_keys: Vec<(ConnId, u16)> = self
            .by_client
            .iter()
            .filter(|((conn, _), _)| *conn == client_conn)
            .map(|(_, talker_key)| *talker_key)
            .collect();

        let mut live = Vec::new();
        for talker_key in talker_keys {
            if let Some(entry) = self.by_talker.get_mut(&talker_key) {
                if !entry.cancelled {
                    entry.cancelled = true;
                    live.push(entry.clone());
                }
            }
        }
        live
    }

    /// Remove every check waiting on a disconnecting agent, returning them
    /// so the dispatch loop can resolve the live ones as DENY.
    pub fn remove_for_agent(&mut self, agent_conn: ConnId) -> Vec<PendingCheck> {
        let talker_keys: Vec<(ConnId, u16)> = self
            .by_talker
            .keys()
            .filter(|(conn, _)| *conn == agent_conn)
            .copied()
            .collect();
        talker_keys
            .into_iter()
            .filter_map(|key| self.remove_by_talker(key.0, key.1))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_talker.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_talker.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use vigil_core::types::PolicyKey;

    fn check(client_conn: ConnId, client_seq: u16, agent_conn: ConnId, talker_seq: u16) -> PendingCheck {
        PendingCheck {
            key: PolicyKey::new("c", "u", "p").unwrap(),
            client_conn,
            client_seq,
            agent_conn,
            talker_seq,
            plugin_type: PolicyType::new(0x10),
            cancelled: false,
        }
    }

    #[test]
    fn insert_rejects_duplicate_client_slot() {
        let mut pending = PendingRequests::new();
        assert!(pending.insert(check(1, 7, 50, 0)));
        assert!(!pending.insert(check(1, 7, 50, 1)));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn lookup_works_from_both_sides() {
        let mut pending = PendingRequests::new();
        pending.insert(check(1, 7, 50, 3));
        assert!(pending.get_by_client(1, 7).is_some());
        assert!(pending.get_by_talker(50, 3).is_some());
        assert!(pending.get_by_client(1, 8).is_none());
    }

    #[test]
    fn cancel_marks_but_keeps_entry() {
        let mut pending = PendingRequests::new();
        pending.insert(check(1, 7, 50, 3));
        let before = pending.cancel(1, 7).unwrap();
        assert!(!before.cancelled);
        assert!(pending.get_by_talker(50, 3).unwrap().cancelled);
        // The talker slot stays busy until the agent answers.
        assert!(pending.contains_talker(50, 3));
    }

    #[test]
    fn remove_clears_both_indexes() {
        let mut pending = PendingRequests::new();
        pending.insert(check(1, 7, 50, 3));
        pending.remove_by_talker(50, 3).unwrap();
        assert!(pending.is_empty());
        assert!(!pending.contains_client(1, 7));
    }

    #[test]
    fn client_disconnect_cancels_only_its_live_checks() {
        let mut pending = PendingRequests::new();
        pending.insert(check(1, 7, 50, 0));
        pending.insert(check(1, 8, 50, 1));
        pending.insert(check(2, 7, 50, 2));
        pending.cancel(1, 8);

        let live = pending.cancel_for_client(1);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].client_seq, 7);
        // Other clients' checks are untouched.
        assert!(!pending.get_by_client(2, 7).unwrap().cancelled);
    }

    #[test]
    fn agent_disconnect_drains_its_checks() {
        let mut pending = PendingRequests::new();
        pending.insert(check(1, 7, 50, 0));
        pending.insert(check(2, 7, 51, 0));
        let drained = pending.remove_for_agent(50);
        assert_eq!(drained.len(), 1);
        assert_eq!(pending.len(), 1);
        assert!(pending.get_by_talker(51, 0).is_some());
    }
}
